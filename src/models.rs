//! Core data models used throughout the question mapper.
//!
//! These types represent the catalog variables, retrieval results, table
//! schemas, and query results that flow through the pipeline.

use geo_types::Geometry;
use serde::Serialize;

/// A census variable known to the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRecord {
    pub name: String,
    pub description: String,
    pub embedding: Vec<f32>,
}

/// A catalog variable together with its similarity to the question.
#[derive(Debug, Clone)]
pub struct ScoredVariable {
    pub variable: VariableRecord,
    pub score: f32,
}

/// Top-k catalog variables ranked by descending similarity.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub items: Vec<ScoredVariable>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.items
            .iter()
            .map(|s| s.variable.name.as_str())
            .collect()
    }
}

/// SQL dialect spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn display_name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "SQLite",
            SqlDialect::Postgres => "PostgreSQL with PostGIS",
        }
    }
}

/// Role a column plays in the census table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Geometry,
    Id,
    /// A statistical variable present in the catalog.
    Variable,
    /// Any other descriptive column (region names, codes).
    Attribute,
}

/// A column of the census table as seen by the prompt and the validator.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaColumn {
    pub name: String,
    pub role: ColumnRole,
    pub description: Option<String>,
}

/// Physical table layout reported by a backend.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub geometry_column: String,
    pub id_column: String,
    /// All column names in table order, geometry included.
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Everything the synthesizer and the validator know about the queryable table.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    pub table: String,
    pub dialect: SqlDialect,
    pub geometry_column: String,
    pub id_column: String,
    pub columns: Vec<SchemaColumn>,
    /// Upper bound on returned rows, enforced on every validated query.
    pub max_rows: u64,
}

impl SchemaDescriptor {
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Non-variable, non-geometry columns useful for filtering.
    pub fn attribute_columns(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.columns
            .iter()
            .filter(|c| matches!(c.role, ColumnRole::Attribute | ColumnRole::Id))
    }
}

/// A scalar cell value returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Human-readable rendering used in tooltips.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{:.0}", f)
                } else {
                    format!("{:.2}", f)
                }
            }
            Value::Text(s) => s.clone(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// A non-geometry column in a [`QueryResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultColumn {
    pub name: String,
    pub is_id: bool,
}

/// One region of a query result.
#[derive(Debug, Clone)]
pub struct GeoFeature {
    pub region_id: String,
    pub geometry: Option<Geometry<f64>>,
    /// Values aligned with [`QueryResult::columns`].
    pub attributes: Vec<Value>,
}

/// Rows returned by a backend, with geometry split out of the attributes.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ResultColumn>,
    pub features: Vec<GeoFeature>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Value of `column` in `feature`, if both exist.
    pub fn value<'a>(&self, feature: &'a GeoFeature, column: &str) -> Option<&'a Value> {
        self.column_index(column)
            .and_then(|i| feature.attributes.get(i))
    }

    /// Region ids in row order.
    pub fn region_ids(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.region_id.as_str()).collect()
    }

    /// Tabular view without geometry, one JSON object per row in column order.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.features
            .iter()
            .map(|f| {
                self.columns
                    .iter()
                    .zip(f.attributes.iter())
                    .map(|(c, v)| (c.name.clone(), v.to_json()))
                    .collect()
            })
            .collect()
    }
}
