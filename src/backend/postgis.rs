//! PostgreSQL/PostGIS backend.
//!
//! Every pooled connection is opened read-only with a server-side statement
//! timeout. Validated queries are wrapped so the server hands back each row
//! as JSON plus its geometry as WGS84 WKT:
//!
//! ```sql
//! SELECT row_to_json(q)::text, ST_AsText(ST_Transform(q.geom, 4326))
//! FROM (<validated query>) AS q
//! ```
//!
//! Going through JSON sidesteps per-type decoding (`numeric`, `int8`,
//! `float4`, ...) and yields the same [`Value`] model as the file backend.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Column, Executor, Row};
use std::time::Duration;

use super::{assemble_result, DataBackend};
use crate::config::DatabaseSourceConfig;
use crate::error::{redact, EngineError};
use crate::models::{QueryResult, SqlDialect, TableSchema, Value};
use crate::validate::SynthesizedQuery;

const ROW_ALIAS: &str = "row_json";
const WKT_ALIAS: &str = "geom_wkt";

pub struct PostgisBackend {
    pool: PgPool,
    schema: TableSchema,
    timeout: Duration,
    password: String,
}

impl PostgisBackend {
    /// Open a pool against `config` and introspect the configured table.
    pub async fn connect(
        config: &DatabaseSourceConfig,
        id_column: &str,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let password = config.db_password.clone();
        Self::open(config, id_column, timeout).await.map_err(|e| {
            EngineError::BackendSetup(redact(&format!("{:#}", e), &[password.as_str()]))
        })
    }

    async fn open(
        config: &DatabaseSourceConfig,
        id_column: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name);

        let statement_timeout_ms = timeout.as_millis();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let set_timeout = format!("SET statement_timeout = {}", statement_timeout_ms);
                    conn.execute(set_timeout.as_str()).await?;
                    conn.execute("SET default_transaction_read_only = on").await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to connect to {}:{}/{}: {}",
                    config.host,
                    config.port,
                    config.db_name,
                    e
                )
            })?;

        let schema = introspect(&pool, &config.table_name, &config.geometry_column, id_column).await?;

        tracing::info!(
            host = %config.host,
            db = %config.db_name,
            table = %schema.table,
            columns = schema.columns.len(),
            "PostGIS backend connected"
        );

        Ok(Self {
            pool,
            schema,
            timeout,
            password: config.db_password.clone(),
        })
    }

    async fn run(&self, sql: &str) -> Result<QueryResult> {
        let wrapped = wrap_query(sql, &self.schema.geometry_column);
        let rows = sqlx::query(&wrapped).fetch_all(&self.pool).await?;

        if rows.is_empty() {
            let describe = (&self.pool).describe(sql).await?;
            let columns = describe
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            return assemble_result(
                columns,
                Vec::new(),
                &self.schema.geometry_column,
                &self.schema.id_column,
            );
        }

        let mut columns: Vec<String> = Vec::new();
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.try_get(ROW_ALIAS)?;
            let wkt: Option<String> = row.try_get(WKT_ALIAS)?;
            let (row_columns, row_values) =
                decode_json_row(&json, wkt, &self.schema.geometry_column)?;
            if columns.is_empty() {
                columns = row_columns;
            }
            values.push(row_values);
        }

        assemble_result(
            columns,
            values,
            &self.schema.geometry_column,
            &self.schema.id_column,
        )
    }
}

#[async_trait]
impl DataBackend for PostgisBackend {
    fn name(&self) -> &str {
        "postgis"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    fn table_schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn execute(&self, query: &SynthesizedQuery) -> Result<QueryResult, EngineError> {
        let secrets = [self.password.as_str()];
        match tokio::time::timeout(self.timeout, self.run(query.sql_text())).await {
            Ok(Ok(result)) => {
                tracing::debug!(rows = result.len(), "PostGIS query executed");
                Ok(result)
            }
            Ok(Err(e)) => Err(EngineError::QueryExecution(redact(
                &format!("{:#}", e),
                &secrets,
            ))),
            Err(_) => Err(EngineError::QueryExecution(format!(
                "query timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

async fn introspect(
    pool: &PgPool,
    table: &str,
    geometry_column: &str,
    id_column: &str,
) -> Result<TableSchema> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT column_name::text, udt_name::text \
         FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        bail!("table `{}` not found in the current schema", table);
    }

    match rows.iter().find(|(name, _)| name == geometry_column) {
        Some((_, udt)) if udt == "geometry" => {}
        Some((_, udt)) => bail!(
            "column `{}` has type {}, expected a PostGIS geometry",
            geometry_column,
            udt
        ),
        None => bail!("table `{}` has no `{}` column", table, geometry_column),
    }
    if !rows.iter().any(|(name, _)| name == id_column) {
        bail!("table `{}` has no `{}` column", table, id_column);
    }

    Ok(TableSchema {
        table: table.to_string(),
        geometry_column: geometry_column.to_string(),
        id_column: id_column.to_string(),
        columns: rows.into_iter().map(|(name, _)| name).collect(),
    })
}

/// Wrap a validated query so rows come back as JSON plus WGS84 WKT geometry.
pub fn wrap_query(sql: &str, geometry_column: &str) -> String {
    format!(
        "SELECT row_to_json(q)::text AS {row}, \
         ST_AsText(ST_Transform(q.{geom}, 4326)) AS {wkt} \
         FROM ({sql}) AS q",
        row = ROW_ALIAS,
        wkt = WKT_ALIAS,
        geom = geometry_column,
        sql = sql,
    )
}

/// Column names and values of one `row_to_json` row.
///
/// The geometry column's JSON rendering is replaced by the reprojected WKT.
pub fn decode_json_row(
    json: &str,
    wkt: Option<String>,
    geometry_column: &str,
) -> Result<(Vec<String>, Vec<Value>)> {
    let parsed: serde_json::Value = serde_json::from_str(json)?;
    let serde_json::Value::Object(object) = parsed else {
        bail!("row is not a JSON object");
    };

    let mut wkt = wkt;
    let mut columns = Vec::with_capacity(object.len());
    let mut values = Vec::with_capacity(object.len());
    for (name, value) in object {
        let value = if name.eq_ignore_ascii_case(geometry_column) {
            wkt.take().map(Value::Text).unwrap_or(Value::Null)
        } else {
            json_to_value(&value)
        };
        columns.push(name);
        values.push(value);
    }
    Ok((columns, values))
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}
