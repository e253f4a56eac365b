//! The variable catalog: every census variable the engine can retrieve.
//!
//! A catalog is assembled from two reference files:
//!
//! - a CSV file with `name` and `description` columns (extra columns are
//!   ignored) which fixes the set of variables and their order, and
//! - a Parquet file (optionally gzip-compressed) with a `name` column and an
//!   `embedding` list column holding the precomputed description embedding.
//!
//! Loading fails with [`EngineError::CatalogLoad`] when a file is missing or
//! malformed, a name is duplicated, a variable has no embedding, or
//! embeddings disagree on dimensionality. The catalog is immutable after load.

use anyhow::{anyhow, bail, Context, Result};
use parquet::record::Field;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::EngineError;
use crate::io::{read_parquet, ParquetTable};
use crate::models::VariableRecord;

#[derive(Debug, Deserialize)]
struct VariableRow {
    name: String,
    description: String,
}

/// Read-only set of census variables with their embeddings.
#[derive(Debug, Clone)]
pub struct VariableCatalog {
    records: Vec<VariableRecord>,
    index: HashMap<String, usize>,
    dims: usize,
}

impl VariableCatalog {
    /// Load the catalog from a variables CSV and an embeddings Parquet file.
    pub fn load(variables_path: &Path, embeddings_path: &Path) -> Result<Self, EngineError> {
        let variables = read_variables(variables_path)
            .map_err(|e| EngineError::CatalogLoad(format!("{:#}", e)))?;
        let embeddings = read_embeddings(embeddings_path)
            .map_err(|e| EngineError::CatalogLoad(format!("{:#}", e)))?;

        let mut records = Vec::with_capacity(variables.len());
        for row in variables {
            let embedding = embeddings.get(&row.name).cloned().ok_or_else(|| {
                EngineError::CatalogLoad(format!("variable '{}' has no embedding", row.name))
            })?;
            records.push(VariableRecord {
                name: row.name,
                description: row.description,
                embedding,
            });
        }

        let catalog = Self::from_records(records)?;
        tracing::info!(
            variables = catalog.len(),
            dims = catalog.dims(),
            "variable catalog loaded"
        );
        Ok(catalog)
    }

    /// Build a catalog from records already in memory, keeping their order.
    pub fn from_records(records: Vec<VariableRecord>) -> Result<Self, EngineError> {
        let mut index = HashMap::with_capacity(records.len());
        let dims = records.first().map(|r| r.embedding.len()).unwrap_or(0);

        for (i, record) in records.iter().enumerate() {
            if record.name.trim().is_empty() {
                return Err(EngineError::CatalogLoad(format!(
                    "variable at row {} has an empty name",
                    i + 1
                )));
            }
            if index.insert(record.name.clone(), i).is_some() {
                return Err(EngineError::CatalogLoad(format!(
                    "duplicate variable name '{}'",
                    record.name
                )));
            }
            if record.embedding.is_empty() {
                return Err(EngineError::CatalogLoad(format!(
                    "variable '{}' has an empty embedding",
                    record.name
                )));
            }
            if record.embedding.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::CatalogLoad(format!(
                    "variable '{}' has a non-finite embedding value",
                    record.name
                )));
            }
            if record.embedding.len() != dims {
                return Err(EngineError::CatalogLoad(format!(
                    "variable '{}' has embedding dimension {} but the catalog uses {}",
                    record.name,
                    record.embedding.len(),
                    dims
                )));
            }
        }

        Ok(Self {
            records,
            index,
            dims,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&VariableRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[VariableRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimensionality shared by every record (0 for an empty catalog).
    pub fn dims(&self) -> usize {
        self.dims
    }
}

fn read_variables(path: &Path) -> Result<Vec<VariableRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open variables catalog: {}", path.display()))?;

    let mut rows = Vec::new();
    for (i, row) in reader.deserialize::<VariableRow>().enumerate() {
        let row = row.with_context(|| {
            format!("Malformed variables catalog {} at row {}", path.display(), i + 1)
        })?;
        rows.push(row);
    }

    if rows.is_empty() {
        bail!("variables catalog {} has no rows", path.display());
    }

    Ok(rows)
}

fn read_embeddings(path: &Path) -> Result<HashMap<String, Vec<f32>>> {
    let table = read_parquet(path)?;

    for required in ["name", "embedding"] {
        if !table.columns.iter().any(|c| c == required) {
            bail!(
                "embeddings file {} has no '{}' column",
                path.display(),
                required
            );
        }
    }

    let mut out = HashMap::with_capacity(table.rows.len());
    for (i, row) in table.rows.iter().enumerate() {
        let name = match ParquetTable::field(row, "name") {
            Some(Field::Str(s)) => s.trim().to_string(),
            _ => bail!("embeddings row {} has no string 'name'", i + 1),
        };
        let embedding = match ParquetTable::field(row, "embedding") {
            Some(Field::ListInternal(list)) => list
                .elements()
                .iter()
                .map(field_to_f32)
                .collect::<Result<Vec<f32>>>()
                .with_context(|| format!("embedding of '{}'", name))?,
            _ => bail!("embeddings row {} ('{}') has no list 'embedding'", i + 1, name),
        };
        out.insert(name, embedding);
    }

    Ok(out)
}

fn field_to_f32(field: &Field) -> Result<f32> {
    match field {
        Field::Float(v) => Ok(*v),
        Field::Double(v) => Ok(*v as f32),
        Field::Int(v) => Ok(*v as f32),
        Field::Long(v) => Ok(*v as f32),
        other => Err(anyhow!("non-numeric embedding component: {}", other)),
    }
}
