use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted by [`load_config`] when no API key is set in the file.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
/// Environment variable consulted by [`load_config`] when no database password is set.
pub const DB_PASSWORD_ENV: &str = "CENSUS_MAP_DB_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// Dataset name; also the table name of the file backend.
    pub name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub variables_catalog_path: PathBuf,
    pub embeddings_path: PathBuf,
}

fn default_id_column() -> String {
    "id".to_string()
}

/// Which spatial store backs the engine.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    File(FileSourceConfig),
    Postgis(DatabaseSourceConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileSourceConfig {
    pub geometry_data_path: PathBuf,
    #[serde(default = "default_geometry_column")]
    pub geometry_column: String,
}

fn default_geometry_column() -> String {
    "geometry".to_string()
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSourceConfig {
    pub table_name: String,
    #[serde(default = "default_geometry_column")]
    pub geometry_column: String,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub db_name: String,
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    /// Recognized but only used when explicitly selected via [`DatabaseSourceConfig::for_tests`].
    #[serde(default)]
    pub test_db_name: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_max_connections() -> u32 {
    5
}

impl std::fmt::Debug for DatabaseSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSourceConfig")
            .field("table_name", &self.table_name)
            .field("geometry_column", &self.geometry_column)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"****")
            .field("test_db_name", &self.test_db_name)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl DatabaseSourceConfig {
    /// Same connection settings pointed at `test_db_name`.
    pub fn for_tests(&self) -> Result<Self> {
        let test_db = self
            .test_db_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.test_db_name is not configured"))?;
        Ok(Self {
            db_name: test_db,
            ..self.clone()
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    /// Corrective re-prompts allowed when the generated SQL fails validation.
    #[serde(default = "default_repair_attempts")]
    pub repair_attempts: u32,
}

fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_repair_attempts() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_rows: default_max_rows(),
        }
    }
}

fn default_max_rows() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    #[serde(default = "default_bins")]
    pub bins: usize,
    /// `[lat, lon]` used when a map has no features.
    #[serde(default = "default_center")]
    pub center: [f64; 2],
    #[serde(default = "default_zoom")]
    pub zoom: u8,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            bins: default_bins(),
            center: default_center(),
            zoom: default_zoom(),
        }
    }
}

fn default_bins() -> usize {
    6
}
fn default_center() -> [f64; 2] {
    [39.6, -8.0]
}
fn default_zoom() -> u8 {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Parse and validate a TOML configuration file.
///
/// Missing secrets are filled from the environment here, at startup, so the
/// engine itself never reads process environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;

    if config.embedding.api_key.is_none() {
        config.embedding.api_key = std::env::var(API_KEY_ENV).ok();
    }
    if config.completion.api_key.is_none() {
        config.completion.api_key = std::env::var(API_KEY_ENV).ok();
    }
    if let SourceConfig::Postgis(db) = &mut config.source {
        if db.db_password.is_empty() {
            db.db_password = std::env::var(DB_PASSWORD_ENV).unwrap_or_default();
        }
    }

    Ok(config)
}

/// Parse and validate configuration text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if !is_identifier(&config.dataset.name) {
        anyhow::bail!(
            "dataset.name must be a plain identifier (letters, digits, underscore): '{}'",
            config.dataset.name
        );
    }

    if !is_identifier(&config.dataset.id_column) {
        anyhow::bail!("dataset.id_column must be a plain identifier");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.execution.max_rows == 0 {
        anyhow::bail!("execution.max_rows must be >= 1");
    }

    if config.map.bins < 2 || config.map.bins > 9 {
        anyhow::bail!("map.bins must be in [2, 9]");
    }

    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if config.embedding.max_retries > 2 || config.completion.max_retries > 2 {
        anyhow::bail!("max_retries must be <= 2");
    }

    if config.completion.repair_attempts > 2 {
        anyhow::bail!("completion.repair_attempts must be <= 2");
    }

    for provider in [&config.embedding.provider, &config.completion.provider] {
        match provider.as_str() {
            "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown provider: '{}'. Must be openai or ollama.",
                other
            ),
        }
    }

    match &config.source {
        SourceConfig::File(file) => {
            if !is_identifier(&file.geometry_column) {
                anyhow::bail!("source.geometry_column must be a plain identifier");
            }
        }
        SourceConfig::Postgis(db) => {
            if !is_identifier(&db.table_name) || !is_identifier(&db.geometry_column) {
                anyhow::bail!("source.table_name and source.geometry_column must be plain identifiers");
            }
            if db.max_connections == 0 {
                anyhow::bail!("source.max_connections must be >= 1");
            }
        }
    }

    Ok(config)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_CONFIG: &str = r#"
[dataset]
name = "censo2021portugal"
id_column = "dicofre"
variables_catalog_path = "data/variables.csv"
embeddings_path = "data/embeddings.parquet.gz"

[source]
kind = "file"
geometry_data_path = "data/freguesias.parquet"

[embedding]
model = "text-embedding-3-small"

[completion]
model = "gpt-4o-mini"
"#;

    #[test]
    fn parses_file_source_with_defaults() {
        let config = parse_config(FILE_CONFIG).unwrap();
        assert_eq!(config.dataset.id_column, "dicofre");
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.completion.repair_attempts, 1);
        assert_eq!(config.embedding.max_retries, 2);
        assert_eq!(config.map.bins, 6);
        match config.source {
            SourceConfig::File(f) => assert_eq!(f.geometry_column, "geometry"),
            _ => panic!("expected file source"),
        }
    }

    #[test]
    fn parses_postgis_source() {
        let text = FILE_CONFIG.replace(
            "kind = \"file\"\ngeometry_data_path = \"data/freguesias.parquet\"",
            "kind = \"postgis\"\ntable_name = \"censo\"\ngeometry_column = \"geom\"\ndb_name = \"gis\"\ndb_user = \"reader\"\ndb_password = \"s3cret\"\ntest_db_name = \"gis_test\"",
        );
        let config = parse_config(&text).unwrap();
        let SourceConfig::Postgis(db) = config.source else {
            panic!("expected postgis source");
        };
        assert_eq!(db.port, 5432);
        assert!(!format!("{:?}", db).contains("s3cret"));
        let test_db = db.for_tests().unwrap();
        assert_eq!(test_db.db_name, "gis_test");
        assert_eq!(db.db_name, "gis");
    }

    #[test]
    fn rejects_unknown_provider() {
        let text = FILE_CONFIG.replace(
            "[embedding]\nmodel",
            "[embedding]\nprovider = \"magic\"\nmodel",
        );
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn rejects_non_identifier_dataset_name() {
        let text = FILE_CONFIG.replace("censo2021portugal", "censo; DROP TABLE x");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn bounds_repair_attempts() {
        let with = |n: u32| {
            FILE_CONFIG.replace(
                "model = \"gpt-4o-mini\"",
                &format!("model = \"gpt-4o-mini\"\nrepair_attempts = {}", n),
            )
        };
        assert_eq!(parse_config(&with(0)).unwrap().completion.repair_attempts, 0);
        assert_eq!(parse_config(&with(2)).unwrap().completion.repair_attempts, 2);
        let err = parse_config(&with(1000)).unwrap_err();
        assert!(err.to_string().contains("completion.repair_attempts"));
    }

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("pct_women"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
