use parquet::data_type::{ByteArray, ByteArrayType, DoubleType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn cmap_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cmap");
    path
}

fn write_string_column(
    row_group: &mut parquet::file::writer::SerializedRowGroupWriter<'_, File>,
    values: &[&str],
) {
    let mut column = row_group.next_column().unwrap().unwrap();
    let values: Vec<ByteArray> = values.iter().map(|s| ByteArray::from(*s)).collect();
    column
        .typed::<ByteArrayType>()
        .write_batch(&values, None, None)
        .unwrap();
    column.close().unwrap();
}

fn write_dataset(path: &Path) {
    let schema = parse_message_type(
        "message censo {
            REQUIRED BYTE_ARRAY dicofre (UTF8);
            REQUIRED DOUBLE pct_women;
            REQUIRED BYTE_ARRAY geometry (UTF8);
        }",
    )
    .unwrap();
    let props = Arc::new(WriterProperties::builder().build());
    let mut writer =
        SerializedFileWriter::new(File::create(path).unwrap(), Arc::new(schema), props).unwrap();
    let mut row_group = writer.next_row_group().unwrap();

    write_string_column(&mut row_group, &["110601", "110602"]);
    let mut column = row_group.next_column().unwrap().unwrap();
    column
        .typed::<DoubleType>()
        .write_batch(&[53.1, 51.0], None, None)
        .unwrap();
    column.close().unwrap();
    write_string_column(
        &mut row_group,
        &[
            "POLYGON((-9.2 38.7, -9.1 38.7, -9.1 38.8, -9.2 38.8, -9.2 38.7))",
            "POLYGON((-9.1 38.7, -9.0 38.7, -9.0 38.8, -9.1 38.7))",
        ],
    );

    row_group.close().unwrap();
    writer.close().unwrap();
}

fn write_embeddings(path: &Path) {
    let schema = parse_message_type(
        "message embeddings {
            REQUIRED BYTE_ARRAY name (UTF8);
            REQUIRED group embedding (LIST) {
                REPEATED group list {
                    REQUIRED DOUBLE element;
                }
            }
        }",
    )
    .unwrap();
    let props = Arc::new(WriterProperties::builder().build());
    let mut writer =
        SerializedFileWriter::new(File::create(path).unwrap(), Arc::new(schema), props).unwrap();
    let mut row_group = writer.next_row_group().unwrap();

    write_string_column(&mut row_group, &["pct_women"]);
    let mut column = row_group.next_column().unwrap().unwrap();
    column
        .typed::<DoubleType>()
        .write_batch(&[0.6, 0.8], Some(&[1i16, 1][..]), Some(&[0i16, 1][..]))
        .unwrap();
    column.close().unwrap();

    row_group.close().unwrap();
    writer.close().unwrap();
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(
        data_dir.join("variables.csv"),
        "name,description\npct_women,Percentage of women in the resident population\n",
    )
    .unwrap();
    write_embeddings(&data_dir.join("embeddings.parquet"));
    write_dataset(&data_dir.join("freguesias.parquet"));

    let config_content = format!(
        r#"[dataset]
name = "censo"
id_column = "dicofre"
variables_catalog_path = "{root}/data/variables.csv"
embeddings_path = "{root}/data/embeddings.parquet"

[source]
kind = "file"
geometry_data_path = "{root}/data/freguesias.parquet"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
url = "http://127.0.0.1:9"

[completion]
provider = "ollama"
model = "llama3"
url = "http://127.0.0.1:9"
{extra}
"#,
        root = root.display(),
        extra = extra
    );

    let config_path = config_dir.join("cmap.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cmap(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cmap_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cmap binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_catalog_lists_variables() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_cmap(&config, &["catalog"]);
    assert!(success, "catalog failed: {}", stderr);
    assert!(stdout.contains("1 variables (2 dimensions)"));
    assert!(stdout.contains("pct_women"));
}

#[test]
fn test_validate_accepts_and_caps_select() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_cmap(
        &config,
        &["validate", "SELECT dicofre, pct_women, geometry FROM censo"],
    );
    assert!(success, "validate failed: {}", stderr);
    assert!(stdout.starts_with("OK"));
    assert!(stdout.contains("LIMIT 10000"));
    assert!(stdout.contains("variables: pct_women"));
}

#[test]
fn test_validate_uses_configured_row_cap() {
    let (_tmp, config) = setup_test_env("\n[execution]\nmax_rows = 25\n");
    let (stdout, _, success) = run_cmap(&config, &["validate", "SELECT dicofre, geometry FROM censo"]);
    assert!(success);
    assert!(stdout.contains("LIMIT 25"));
}

#[test]
fn test_validate_rejects_writes() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_cmap(&config, &["validate", "DELETE FROM censo"]);
    assert!(!success);
    assert!(!stdout.contains("OK"));
    assert!(stderr.contains("Rejected"));
}

#[test]
fn test_validate_rejects_unknown_table() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_cmap(&config, &["validate", "SELECT * FROM sqlite_master"]);
    assert!(!success);
    assert!(stderr.contains("Rejected"));
}

#[test]
fn test_test_db_requires_postgis_source() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_cmap(
        &config,
        &["validate", "--test-db", "SELECT dicofre, geometry FROM censo"],
    );
    assert!(!success);
    assert!(stderr.contains("--test-db"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config) = setup_test_env("\n[map]\nbins = 12\n");
    let (_, stderr, success) = run_cmap(&config, &["catalog"]);
    assert!(!success);
    assert!(stderr.contains("map.bins"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cmap(&tmp.path().join("nope.toml"), &["catalog"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
