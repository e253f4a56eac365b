//! The question mapper: question in, map + data + SQL out.
//!
//! [`QuestionMapper`] owns the variable catalog and a handle to one
//! [`DataBackend`]. Each call to [`QuestionMapper::to_map`] runs the full
//! pipeline independently:
//!
//! ```text
//! question ─► Retriever ─► QuerySynthesizer ─► DataBackend ─► materialize
//!              (catalog)     (validated SQL)     (rows)          (map)
//! ```
//!
//! A request either produces a complete [`MapBundle`] or fails at exactly one
//! stage with an [`EngineError`]. The mapper holds no per-request state and
//! is `Send + Sync`; share it behind an `Arc`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::file::FileBackendOptions;
use crate::backend::{open_backend, DataBackend, FileBackend, PostgisBackend};
use crate::catalog::VariableCatalog;
use crate::completion::{self, CompletionProvider};
use crate::config::{Config, DatabaseSourceConfig, MapConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::EngineError;
use crate::map::{materialize, MapArtifact};
use crate::models::{
    ColumnRole, QueryResult, RetrievalResult, SchemaColumn, SchemaDescriptor, SqlDialect,
    TableSchema,
};
use crate::retrieval::{validate_question, Retriever};
use crate::synthesis::QuerySynthesizer;
use crate::validate::{validate, SynthesizedQuery};

/// Construction parameters for a file-backed engine.
#[derive(Debug, Clone)]
pub struct FileModeOptions {
    pub dataset_name: String,
    pub geometry_data_path: PathBuf,
    pub embeddings_path: PathBuf,
    pub variables_catalog_path: PathBuf,
    pub geometry_column: String,
    pub id_column: String,
}

/// Reference files the catalog is loaded from.
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub variables_catalog_path: PathBuf,
    pub embeddings_path: PathBuf,
}

/// Tunables shared by both construction modes.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub top_k: usize,
    pub repair_attempts: u32,
    pub max_rows: u64,
    pub execution_timeout: Duration,
    pub map: MapConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            repair_attempts: 1,
            max_rows: 10_000,
            execution_timeout: Duration::from_secs(30),
            map: MapConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            repair_attempts: config.completion.repair_attempts,
            max_rows: config.execution.max_rows,
            execution_timeout: Duration::from_secs(config.execution.timeout_secs),
            map: config.map.clone(),
        }
    }
}

/// A retrieved candidate variable as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedVariable {
    pub name: String,
    pub description: String,
    pub score: f32,
}

/// Everything produced for one question.
#[derive(Debug, Clone)]
pub struct MapBundle {
    pub map: MapArtifact,
    pub data: QueryResult,
    /// The validated SQL that was executed.
    pub sql: String,
    /// Candidate variables in retrieval order.
    pub variables: Vec<RetrievedVariable>,
    /// Catalog variables the executed SQL references.
    pub referenced_variables: Vec<String>,
}

pub struct QuestionMapper {
    catalog: VariableCatalog,
    backend: Arc<dyn DataBackend>,
    retriever: Retriever,
    synthesizer: QuerySynthesizer,
    schema: SchemaDescriptor,
    map_config: MapConfig,
}

impl QuestionMapper {
    /// Assemble an engine from already-constructed parts.
    pub fn new(
        catalog: VariableCatalog,
        backend: Arc<dyn DataBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        completer: Arc<dyn CompletionProvider>,
        settings: EngineSettings,
    ) -> Self {
        let schema = describe_schema(
            backend.table_schema(),
            backend.dialect(),
            &catalog,
            settings.max_rows,
        );

        let missing = catalog
            .records()
            .iter()
            .filter(|r| !schema.has_column(&r.name))
            .count();
        if missing > 0 {
            tracing::warn!(
                missing,
                table = %schema.table,
                "catalog variables without a matching table column"
            );
        }

        tracing::info!(
            backend = backend.name(),
            table = %schema.table,
            variables = catalog.len(),
            top_k = settings.top_k,
            embedding_model = embedder.model_name(),
            completion_model = completer.model_name(),
            "question mapper ready"
        );

        Self {
            catalog,
            backend,
            retriever: Retriever::new(embedder, settings.top_k),
            synthesizer: QuerySynthesizer::new(completer, settings.repair_attempts),
            schema,
            map_config: settings.map,
        }
    }

    /// Engine over a local Parquet geometry file.
    pub async fn from_file(
        options: FileModeOptions,
        embedder: Arc<dyn EmbeddingProvider>,
        completer: Arc<dyn CompletionProvider>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let catalog =
            VariableCatalog::load(&options.variables_catalog_path, &options.embeddings_path)?;
        let backend = FileBackend::open(
            &options.geometry_data_path,
            FileBackendOptions {
                table: options.dataset_name,
                geometry_column: options.geometry_column,
                id_column: options.id_column,
                timeout: settings.execution_timeout,
            },
        )
        .await?;
        Ok(Self::new(
            catalog,
            Arc::new(backend),
            embedder,
            completer,
            settings,
        ))
    }

    /// Engine over a PostGIS table.
    pub async fn from_postgis(
        database: &DatabaseSourceConfig,
        id_column: &str,
        catalog_paths: CatalogPaths,
        embedder: Arc<dyn EmbeddingProvider>,
        completer: Arc<dyn CompletionProvider>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let catalog = VariableCatalog::load(
            &catalog_paths.variables_catalog_path,
            &catalog_paths.embeddings_path,
        )?;
        let backend =
            PostgisBackend::connect(database, id_column, settings.execution_timeout).await?;
        Ok(Self::new(
            catalog,
            Arc::new(backend),
            embedder,
            completer,
            settings,
        ))
    }

    /// Engine described by a loaded configuration.
    ///
    /// With `test_db`, a PostGIS source connects to its `test_db_name`.
    pub async fn from_config(config: &Config, test_db: bool) -> Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)
            .context("Failed to create embedding provider")?;
        let completer = completion::create_provider(&config.completion)
            .context("Failed to create completion provider")?;
        let settings = EngineSettings::from_config(config);

        let catalog = VariableCatalog::load(
            &config.dataset.variables_catalog_path,
            &config.dataset.embeddings_path,
        )?;
        let backend = open_backend(config, test_db).await?;
        Ok(Self::new(catalog, backend, embedder, completer, settings))
    }

    pub fn catalog(&self) -> &VariableCatalog {
        &self.catalog
    }

    /// The table layout prompts and validation work against.
    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Candidate variables for `question`, without synthesis or execution.
    pub async fn retrieve(&self, question: &str) -> Result<RetrievalResult, EngineError> {
        self.retriever.retrieve(question, &self.catalog).await
    }

    /// Check `sql` against the safety boundary for this engine's table.
    pub fn validate_sql(&self, sql: &str) -> Result<SynthesizedQuery, EngineError> {
        validate(sql, &self.schema)
    }

    /// Answer `question` with a map, its data, and the SQL that produced it.
    pub async fn to_map(&self, question: &str) -> Result<MapBundle, EngineError> {
        let started = Instant::now();
        let outcome = self.run(question).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(bundle) => tracing::info!(
                rows = bundle.data.len(),
                value_column = ?bundle.map.value_column,
                elapsed_ms,
                "question mapped"
            ),
            Err(e) => tracing::warn!(
                stage = %e.stage(),
                code = e.code(),
                error = %e,
                elapsed_ms,
                "question failed"
            ),
        }
        outcome
    }

    async fn run(&self, question: &str) -> Result<MapBundle, EngineError> {
        let question = validate_question(question)?;

        let candidates = self.retriever.retrieve(question, &self.catalog).await?;
        let query = self
            .synthesizer
            .synthesize(question, &candidates, &self.schema)
            .await?;
        let data = self.backend.execute(&query).await?;
        let map = materialize(&data, &self.map_config);

        let variables = candidates
            .items
            .iter()
            .map(|s| RetrievedVariable {
                name: s.variable.name.clone(),
                description: s.variable.description.clone(),
                score: s.score,
            })
            .collect();

        Ok(MapBundle {
            map,
            data,
            sql: query.sql_text().to_string(),
            variables,
            referenced_variables: query.referenced_variables().iter().cloned().collect(),
        })
    }
}

/// Combine a backend's table layout with catalog descriptions.
pub fn describe_schema(
    table: &TableSchema,
    dialect: SqlDialect,
    catalog: &VariableCatalog,
    max_rows: u64,
) -> SchemaDescriptor {
    let columns = table
        .columns
        .iter()
        .map(|name| {
            let record = catalog.lookup(name);
            let role = if name.eq_ignore_ascii_case(&table.geometry_column) {
                ColumnRole::Geometry
            } else if name.eq_ignore_ascii_case(&table.id_column) {
                ColumnRole::Id
            } else if record.is_some() {
                ColumnRole::Variable
            } else {
                ColumnRole::Attribute
            };
            SchemaColumn {
                name: name.clone(),
                role,
                description: record.map(|r| r.description.clone()),
            }
        })
        .collect();

    SchemaDescriptor {
        table: table.table.clone(),
        dialect,
        geometry_column: table.geometry_column.clone(),
        id_column: table.id_column.clone(),
        columns,
        max_rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VariableRecord;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn mapper_is_shareable() {
        assert_send_sync::<QuestionMapper>();
    }

    #[test]
    fn schema_roles_come_from_table_and_catalog() {
        let catalog = VariableCatalog::from_records(vec![VariableRecord {
            name: "pct_women".into(),
            description: "Percentage of women".into(),
            embedding: vec![1.0, 0.0],
        }])
        .unwrap();
        let table = TableSchema {
            table: "censo".into(),
            geometry_column: "geom".into(),
            id_column: "dicofre".into(),
            columns: vec![
                "dicofre".into(),
                "municipio".into(),
                "pct_women".into(),
                "geom".into(),
            ],
        };
        let schema = describe_schema(&table, SqlDialect::Sqlite, &catalog, 100);
        let roles: Vec<ColumnRole> = schema.columns.iter().map(|c| c.role).collect();
        assert_eq!(
            roles,
            vec![
                ColumnRole::Id,
                ColumnRole::Attribute,
                ColumnRole::Variable,
                ColumnRole::Geometry
            ]
        );
        assert_eq!(
            schema.column("pct_women").unwrap().description.as_deref(),
            Some("Percentage of women")
        );
        assert_eq!(schema.max_rows, 100);
    }
}
