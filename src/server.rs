//! JSON HTTP API over a [`QuestionMapper`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/map` | Answer a question: map, data, SQL, retrieved variables |
//! | `GET`  | `/catalog` | List the catalog variables and the queryable table |
//! | `GET`  | `/health` | Health check (returns version and backend) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_input", "message": "question must not be empty" } }
//! ```
//!
//! Codes are [`EngineError::code`] values plus `bad_request`. Messages are the
//! user-facing [`EngineError::user_message`]; internal details (generated
//! SQL, driver errors) only go to the log.
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `invalid_input` | 400 |
//! | `unsafe_query` | 422 |
//! | `embedding_service`, `completion_service` | 503 |
//! | `query_execution`, `catalog_load`, `backend_setup` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends can
//! call the API directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::{QuestionMapper, RetrievedVariable};
use crate::error::EngineError;
use crate::models::ResultColumn;

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config, mapper: Arc<QuestionMapper>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(mapper);

    println!("Map server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes with CORS applied, ready to serve.
pub fn router(mapper: Arc<QuestionMapper>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/map", post(handle_map))
        .route("/catalog", get(handle_catalog))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(mapper)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError {
            status: status_for(&err),
            code: err.code().to_string(),
            message: err.user_message(),
        }
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::UnsafeQuery { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::EmbeddingService(_) | EngineError::CompletionService(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::QueryExecution(_)
        | EngineError::CatalogLoad(_)
        | EngineError::BackendSetup(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backend: String,
}

async fn handle_health(State(mapper): State<Arc<QuestionMapper>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: mapper.backend_name().to_string(),
    })
}

// ============ GET /catalog ============

#[derive(Serialize)]
struct CatalogEntry {
    name: String,
    description: String,
}

#[derive(Serialize)]
struct CatalogResponse {
    table: String,
    dialect: String,
    variables: Vec<CatalogEntry>,
}

async fn handle_catalog(State(mapper): State<Arc<QuestionMapper>>) -> Json<CatalogResponse> {
    let schema = mapper.schema();
    Json(CatalogResponse {
        table: schema.table.clone(),
        dialect: schema.dialect.display_name().to_string(),
        variables: mapper
            .catalog()
            .records()
            .iter()
            .map(|r| CatalogEntry {
                name: r.name.clone(),
                description: r.description.clone(),
            })
            .collect(),
    })
}

// ============ POST /map ============

#[derive(Deserialize)]
struct MapRequest {
    question: String,
}

#[derive(Serialize)]
struct MapResponse {
    sql: String,
    variables: Vec<RetrievedVariable>,
    referenced_variables: Vec<String>,
    columns: Vec<ResultColumn>,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// GeoJSON `FeatureCollection` with legend and bounds.
    map: serde_json::Value,
}

/// Runs the whole pipeline for one question.
///
/// Returns `400` for a missing or invalid question, `422` when no safe query
/// could be produced, `503` when a language service is down, and `500` when
/// execution fails. An empty result is a `200` with zero rows.
async fn handle_map(
    State(mapper): State<Arc<QuestionMapper>>,
    Json(req): Json<MapRequest>,
) -> Result<Json<MapResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let bundle = mapper.to_map(&req.question).await?;

    Ok(Json(MapResponse {
        rows: bundle.data.to_records(),
        columns: bundle.data.columns,
        map: bundle.map.to_geojson(),
        sql: bundle.sql,
        variables: bundle.variables,
        referenced_variables: bundle.referenced_variables,
    }))
}
