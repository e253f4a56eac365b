//! Readers for the persisted input formats.
//!
//! Parquet files may be stored plain or gzip-compressed (`.parquet.gz`).
//! Compressed files are inflated into memory first because Parquet needs
//! random access to its footer.

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use std::io::Read;
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read a whole file, inflating it when it carries the gzip magic bytes.
pub fn read_maybe_gzipped(path: &Path) -> Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        let mut inflated = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut inflated)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
        Ok(inflated)
    } else {
        Ok(raw)
    }
}

/// Top-level column names and all rows of a Parquet file.
pub struct ParquetTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ParquetTable {
    /// Fields of `row` keyed by column name.
    pub fn field<'a>(row: &'a Row, column: &str) -> Option<&'a Field> {
        row.get_column_iter()
            .find(|(name, _)| name.as_str() == column)
            .map(|(_, field)| field)
    }
}

pub fn read_parquet(path: &Path) -> Result<ParquetTable> {
    let bytes = Bytes::from(read_maybe_gzipped(path)?);
    let reader = SerializedFileReader::new(bytes)
        .with_context(|| format!("{} is not a valid Parquet file", path.display()))?;

    let columns: Vec<String> = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect();

    let mut rows = Vec::new();
    for row in reader.get_row_iter(None)? {
        rows.push(row.with_context(|| format!("Corrupt row in {}", path.display()))?);
    }

    Ok(ParquetTable { columns, rows })
}
