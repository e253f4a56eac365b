//! File-backed dataset executed by an embedded SQLite engine.
//!
//! The geometry+attribute Parquet file is read once at construction, every
//! geometry is checked, and the rows are loaded into an in-memory SQLite
//! database. The connection is then switched to `query_only`, so the dataset
//! is read-only for the lifetime of the backend.
//!
//! Geometry is stored as WKT text in WGS84 lon/lat. The pool holds a single
//! connection that never expires (the in-memory database lives exactly as
//! long as that connection), so concurrent requests are serialized on it.
//! Each query installs a progress handler that interrupts the statement once
//! its request deadline passes, so a slow query releases the connection
//! instead of holding it for later requests.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parquet::record::Field;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{assemble_result, DataBackend};
use crate::config::is_identifier;
use crate::error::EngineError;
use crate::geometry::parse_region;
use crate::io::read_parquet;
use crate::models::{QueryResult, SqlDialect, TableSchema, Value};
use crate::validate::SynthesizedQuery;

/// How a file dataset is exposed as a table.
#[derive(Debug, Clone)]
pub struct FileBackendOptions {
    /// Table name seen by generated SQL (the dataset name).
    pub table: String,
    pub geometry_column: String,
    pub id_column: String,
    pub timeout: Duration,
}

/// SQLite VM instructions between deadline checks.
const PROGRESS_OPS: i32 = 1000;

/// Extra time the async timeout waits for an interrupted statement to unwind.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

pub struct FileBackend {
    pool: SqlitePool,
    schema: TableSchema,
    timeout: Duration,
}

impl FileBackend {
    /// Load a Parquet geometry+attribute file.
    pub async fn open(path: &Path, options: FileBackendOptions) -> Result<Self, EngineError> {
        let (columns, rows) = read_dataset(path, &options.geometry_column)
            .map_err(|e| EngineError::BackendSetup(format!("{:#}", e)))?;
        Self::from_rows(columns, rows, options).await
    }

    /// Build a backend from rows already in memory.
    ///
    /// Every row must carry valid WKT region geometry and a non-null id.
    pub async fn from_rows(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        options: FileBackendOptions,
    ) -> Result<Self, EngineError> {
        Self::load(columns, rows, options)
            .await
            .map_err(|e| EngineError::BackendSetup(format!("{:#}", e)))
    }

    async fn load(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        options: FileBackendOptions,
    ) -> Result<Self> {
        if !is_identifier(&options.table) {
            bail!("table name '{}' is not a plain identifier", options.table);
        }
        let geom_idx = find_column(&columns, &options.geometry_column)?;
        let id_idx = find_column(&columns, &options.id_column)?;

        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!("row {} has {} values for {} columns", i + 1, row.len(), columns.len());
            }
            if row[id_idx].is_null() {
                bail!("row {} has no `{}`", i + 1, options.id_column);
            }
            match &row[geom_idx] {
                Value::Text(wkt) => {
                    parse_region(wkt)
                        .with_context(|| format!("region '{}'", row[id_idx].display()))?;
                }
                _ => bail!("row {} has no WKT geometry", i + 1),
            }
        }

        let sql_types: Vec<&str> = (0..columns.len())
            .map(|i| {
                if i == geom_idx {
                    "TEXT"
                } else {
                    column_affinity(rows.iter().map(|r| &r[i]))
                }
            })
            .collect();

        let options_sqlite = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options_sqlite)
            .await?;

        let column_defs: Vec<String> = columns
            .iter()
            .zip(&sql_types)
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .collect();
        sqlx::query(&format!(
            "CREATE TABLE {} ({})",
            quote_ident(&options.table),
            column_defs.join(", ")
        ))
        .execute(&pool)
        .await?;

        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&options.table),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut tx = pool.begin().await?;
        for row in &rows {
            let mut q = sqlx::query(&insert_sql);
            for value in row {
                q = match value {
                    Value::Null => q.bind(None::<String>),
                    Value::Bool(b) => q.bind(*b as i64),
                    Value::Int(i) => q.bind(*i),
                    Value::Float(f) => q.bind(*f),
                    Value::Text(s) => q.bind(s.clone()),
                };
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        sqlx::query("PRAGMA query_only = ON").execute(&pool).await?;

        tracing::info!(
            table = %options.table,
            rows = rows.len(),
            columns = columns.len(),
            "file dataset loaded"
        );

        Ok(Self {
            pool,
            schema: TableSchema {
                table: options.table,
                geometry_column: columns[geom_idx].clone(),
                id_column: columns[id_idx].clone(),
                columns,
            },
            timeout: options.timeout,
        })
    }

    async fn run(&self, sql: &str, deadline: Instant) -> Result<QueryResult> {
        let mut conn = self.pool.acquire().await?;
        conn.lock_handle()
            .await?
            .set_progress_handler(PROGRESS_OPS, move || Instant::now() < deadline);

        let rows: Vec<SqliteRow> = sqlx::query(sql).fetch_all(&mut *conn).await?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => (&mut *conn)
                .describe(sql)
                .await?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };

        let values = rows
            .iter()
            .map(decode_row)
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        assemble_result(
            columns,
            values,
            &self.schema.geometry_column,
            &self.schema.id_column,
        )
    }
}

#[async_trait]
impl DataBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn table_schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn execute(&self, query: &SynthesizedQuery) -> Result<QueryResult, EngineError> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = || {
            EngineError::QueryExecution(format!(
                "query timed out after {}s",
                self.timeout.as_secs()
            ))
        };
        match tokio::time::timeout(
            self.timeout + INTERRUPT_GRACE,
            self.run(query.sql_text(), deadline),
        )
        .await
        {
            Ok(Ok(result)) => {
                tracing::debug!(rows = result.len(), "file query executed");
                Ok(result)
            }
            Ok(Err(_)) if Instant::now() >= deadline => Err(timed_out()),
            Ok(Err(e)) => Err(EngineError::QueryExecution(format!("{:#}", e))),
            Err(_) => Err(timed_out()),
        }
    }
}

fn find_column(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("dataset has no `{}` column", name))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLite type for a column given its values.
fn column_affinity<'a>(values: impl Iterator<Item = &'a Value>) -> &'static str {
    let mut affinity = "INTEGER";
    for value in values {
        match value {
            Value::Null | Value::Int(_) | Value::Bool(_) => {}
            Value::Float(_) => affinity = "REAL",
            Value::Text(_) => return "TEXT",
        }
    }
    affinity
}

fn decode_row(row: &SqliteRow) -> std::result::Result<Vec<Value>, sqlx::Error> {
    let mut out = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let type_name = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                out.push(Value::Null);
                continue;
            }
            raw.type_info().name().to_string()
        };
        let value = match type_name.as_str() {
            "INTEGER" | "BOOLEAN" => Value::Int(row.try_get_unchecked::<i64, _>(i)?),
            "REAL" | "NUMERIC" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
            "BLOB" => Value::Null,
            _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
        };
        out.push(value);
    }
    Ok(out)
}

/// Column names and rows of a Parquet dataset.
fn read_dataset(path: &Path, geometry_column: &str) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let table = read_parquet(path)?;
    let mut rows = Vec::with_capacity(table.rows.len());

    for (i, row) in table.rows.iter().enumerate() {
        let mut values = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let value = match crate::io::ParquetTable::field(row, column) {
                None => Value::Null,
                Some(Field::Bytes(_)) if column.eq_ignore_ascii_case(geometry_column) => bail!(
                    "row {}: geometry is binary (WKB); store `{}` as WKT text",
                    i + 1,
                    geometry_column
                ),
                Some(field) => field_to_value(field),
            };
            values.push(value);
        }
        rows.push(values);
    }

    Ok((table.columns, rows))
}

fn field_to_value(field: &Field) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Byte(v) => Value::Int(*v as i64),
        Field::Short(v) => Value::Int(*v as i64),
        Field::Int(v) => Value::Int(*v as i64),
        Field::Long(v) => Value::Int(*v),
        Field::UByte(v) => Value::Int(*v as i64),
        Field::UShort(v) => Value::Int(*v as i64),
        Field::UInt(v) => Value::Int(*v as i64),
        Field::ULong(v) => Value::Int(*v as i64),
        Field::Float(v) => Value::Float(*v as f64),
        Field::Double(v) => Value::Float(*v),
        Field::Str(s) => Value::Text(s.clone()),
        Field::Bytes(b) => Value::Text(String::from_utf8_lossy(b.data()).into_owned()),
        other => {
            let text = other.to_string();
            text.parse::<f64>()
                .map(Value::Float)
                .unwrap_or(Value::Text(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_widens() {
        let ints = [Value::Int(1), Value::Null];
        assert_eq!(column_affinity(ints.iter()), "INTEGER");
        let mixed = [Value::Int(1), Value::Float(2.5)];
        assert_eq!(column_affinity(mixed.iter()), "REAL");
        let text = [Value::Float(1.0), Value::Text("x".into())];
        assert_eq!(column_affinity(text.iter()), "TEXT");
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn parquet_fields_map_to_values() {
        assert_eq!(field_to_value(&Field::Int(3)), Value::Int(3));
        assert_eq!(field_to_value(&Field::Double(0.5)), Value::Float(0.5));
        assert_eq!(
            field_to_value(&Field::Str("Lisboa".into())),
            Value::Text("Lisboa".into())
        );
        assert_eq!(field_to_value(&Field::Null), Value::Null);
    }
}
