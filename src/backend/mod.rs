//! Spatial data backends.
//!
//! The [`DataBackend`] trait is the single contract the engine executes
//! queries through. Two implementations ship with the crate:
//!
//! | Backend | Store | Dialect |
//! |---------|-------|---------|
//! | [`FileBackend`] | Parquet file loaded into an embedded SQLite engine | SQLite |
//! | [`PostgisBackend`] | pooled PostgreSQL/PostGIS connection | PostgreSQL |
//!
//! Adding a store means adding an implementation; callers never branch on
//! the concrete backend. Both decode rows into the same [`Value`] model and
//! assemble results with [`assemble_result`], so equivalent rows produce
//! equivalent [`QueryResult`]s.

pub mod file;
pub mod postgis;

pub use file::FileBackend;
pub use postgis::PostgisBackend;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SourceConfig};
use crate::error::EngineError;
use crate::geometry::parse_region;
use crate::models::{GeoFeature, QueryResult, ResultColumn, SqlDialect, TableSchema, Value};
use crate::validate::SynthesizedQuery;

/// A spatial store that executes validated queries.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Short label used in logs (e.g. `"file"`, `"postgis"`).
    fn name(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    /// Layout of the queryable table.
    fn table_schema(&self) -> &TableSchema;

    /// Execute `query` and return rows with WGS84 geometry.
    ///
    /// Errors are [`EngineError::QueryExecution`] with credentials removed.
    async fn execute(&self, query: &SynthesizedQuery) -> Result<QueryResult, EngineError>;
}

/// Open the backend named by `config.source`.
///
/// With `test_db`, a PostGIS source connects to its `test_db_name` instead.
pub async fn open_backend(config: &Config, test_db: bool) -> Result<Arc<dyn DataBackend>> {
    let timeout = Duration::from_secs(config.execution.timeout_secs);
    let backend: Arc<dyn DataBackend> = match &config.source {
        SourceConfig::File(file) => {
            if test_db {
                anyhow::bail!("--test-db only applies to a postgis source");
            }
            let options = file::FileBackendOptions {
                table: config.dataset.name.clone(),
                geometry_column: file.geometry_column.clone(),
                id_column: config.dataset.id_column.clone(),
                timeout,
            };
            Arc::new(FileBackend::open(&file.geometry_data_path, options).await?)
        }
        SourceConfig::Postgis(db) => {
            let db = if test_db { db.for_tests()? } else { db.clone() };
            Arc::new(PostgisBackend::connect(&db, &config.dataset.id_column, timeout).await?)
        }
    };
    Ok(backend)
}

/// Split raw rows into id, geometry, and attribute columns.
///
/// Geometry cells must be WKT text of a valid region (or NULL); a literal or
/// computed geometry that is not a polygon in lon/lat fails the whole result.
/// Column order is preserved for every non-geometry column.
pub fn assemble_result(
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    geometry_column: &str,
    id_column: &str,
) -> Result<QueryResult> {
    let geom_idx = columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(geometry_column))
        .ok_or_else(|| anyhow!("result has no geometry column `{}`", geometry_column))?;
    let id_idx = columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(id_column))
        .ok_or_else(|| anyhow!("result has no id column `{}`", id_column))?;

    let result_columns: Vec<ResultColumn> = columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != geom_idx)
        .map(|(i, name)| ResultColumn {
            name: name.clone(),
            is_id: i == id_idx,
        })
        .collect();

    let mut features = Vec::with_capacity(rows.len());
    for (row_no, row) in rows.into_iter().enumerate() {
        if row.len() != columns.len() {
            return Err(anyhow!(
                "row {} has {} values for {} columns",
                row_no + 1,
                row.len(),
                columns.len()
            ));
        }

        let region_id = row[id_idx].display();
        let geometry = match &row[geom_idx] {
            Value::Null => None,
            Value::Text(wkt) => Some(
                parse_region(wkt).map_err(|e| anyhow!("region '{}': {}", region_id, e))?,
            ),
            other => {
                return Err(anyhow!(
                    "region '{}': geometry is not WKT text ({:?})",
                    region_id,
                    other
                ))
            }
        };

        let attributes = row
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != geom_idx)
            .map(|(_, v)| v)
            .collect();

        features.push(GeoFeature {
            region_id,
            geometry,
            attributes,
        });
    }

    Ok(QueryResult {
        columns: result_columns,
        features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_geometry_from_attributes() {
        let result = assemble_result(
            vec!["dicofre".into(), "geom".into(), "pct_women".into()],
            vec![vec![
                Value::Text("110601".into()),
                Value::Text("POLYGON((0 0, 1 0, 1 1, 0 0))".into()),
                Value::Float(52.5),
            ]],
            "geom",
            "dicofre",
        )
        .unwrap();
        assert_eq!(result.columns.len(), 2);
        assert!(result.columns[0].is_id);
        assert_eq!(result.features[0].region_id, "110601");
        assert!(result.features[0].geometry.is_some());
        assert_eq!(result.features[0].attributes[1], Value::Float(52.5));
    }

    #[test]
    fn empty_rows_are_a_valid_result() {
        let result = assemble_result(
            vec!["dicofre".into(), "geom".into()],
            vec![],
            "geom",
            "dicofre",
        )
        .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.columns.len(), 1);
    }

    #[test]
    fn result_geometry_must_be_a_region() {
        let row = |wkt: &str| {
            vec![Value::Text("110601".into()), Value::Text(wkt.into())]
        };
        for wkt in [
            "POINT(0 0)",
            "POLYGON((0 0, 1 1, 1 0, 0 1, 0 0))",
            "POLYGON((500000 4000000, 500100 4000000, 500100 4000100, 500000 4000000))",
        ] {
            let err = assemble_result(
                vec!["dicofre".into(), "geom".into()],
                vec![row(wkt)],
                "geom",
                "dicofre",
            )
            .unwrap_err();
            assert!(err.to_string().contains("region '110601'"), "{wkt}");
        }
    }

    #[test]
    fn missing_geometry_column_is_an_error() {
        assert!(assemble_result(vec!["dicofre".into()], vec![], "geom", "dicofre").is_err());
    }
}
