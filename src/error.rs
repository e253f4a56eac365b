//! Typed errors surfaced at the engine boundary.
//!
//! Internal plumbing uses `anyhow` and is converted into one [`EngineError`]
//! per failed request. Every variant belongs to exactly one pipeline
//! [`Stage`] and carries a user-facing message via
//! [`EngineError::user_message`].
//!
//! | Variant | Stage | Shown to the user |
//! |---------|-------|-------------------|
//! | `InvalidInput` | input | verbatim |
//! | `EmbeddingService` | retrieval | "try again" |
//! | `CompletionService` | synthesis | "try again" |
//! | `UnsafeQuery` | synthesis | generic failure, SQL only logged |
//! | `QueryExecution` | execution | "no result for this question" |
//! | `CatalogLoad` | startup | fatal |
//! | `BackendSetup` | startup | fatal |

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage at which a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Startup,
    Input,
    Retrieval,
    Synthesis,
    Execution,
    Materialization,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Startup => "startup",
            Stage::Input => "input",
            Stage::Retrieval => "retrieval",
            Stage::Synthesis => "synthesis",
            Stage::Execution => "execution",
            Stage::Materialization => "materialization",
        };
        f.write_str(s)
    }
}

/// Errors returned by the question mapper.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Empty or malformed question.
    #[error("invalid question: {0}")]
    InvalidInput(String),

    /// The embedding service failed or timed out after retries.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The completion service failed or timed out after retries.
    #[error("completion service error: {0}")]
    CompletionService(String),

    /// The generated SQL did not pass validation. `sql` is kept for logging
    /// only and is not part of the display string.
    #[error("generated query rejected: {reason}")]
    UnsafeQuery { reason: String, sql: Option<String> },

    /// The backend rejected or failed on a validated query.
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// Reference data for the variable catalog is missing or malformed.
    #[error("catalog load failed: {0}")]
    CatalogLoad(String),

    /// The data backend could not be constructed.
    #[error("backend setup failed: {0}")]
    BackendSetup(String),
}

impl EngineError {
    pub fn unsafe_query(reason: impl Into<String>, sql: Option<String>) -> Self {
        EngineError::UnsafeQuery {
            reason: reason.into(),
            sql,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EngineError::InvalidInput(_) => Stage::Input,
            EngineError::EmbeddingService(_) => Stage::Retrieval,
            EngineError::CompletionService(_) | EngineError::UnsafeQuery { .. } => {
                Stage::Synthesis
            }
            EngineError::QueryExecution(_) => Stage::Execution,
            EngineError::CatalogLoad(_) | EngineError::BackendSetup(_) => Stage::Startup,
        }
    }

    /// Machine-readable error code used by the HTTP API.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::EmbeddingService(_) => "embedding_service",
            EngineError::CompletionService(_) => "completion_service",
            EngineError::UnsafeQuery { .. } => "unsafe_query",
            EngineError::QueryExecution(_) => "query_execution",
            EngineError::CatalogLoad(_) => "catalog_load",
            EngineError::BackendSetup(_) => "backend_setup",
        }
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InvalidInput(msg) => msg.clone(),
            EngineError::EmbeddingService(_) | EngineError::CompletionService(_) => {
                "The language service is unavailable right now. Please try again.".to_string()
            }
            EngineError::UnsafeQuery { .. } => {
                "Could not build a map for this question. Try rephrasing it.".to_string()
            }
            EngineError::QueryExecution(_) => "No result for this question.".to_string(),
            EngineError::CatalogLoad(_) | EngineError::BackendSetup(_) => {
                "The service is not ready.".to_string()
            }
        }
    }
}

/// Replace every occurrence of each non-empty secret in `message`.
pub fn redact(message: &str, secrets: &[&str]) -> String {
    let mut out = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, "****");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_query_display_hides_sql() {
        let err = EngineError::unsafe_query(
            "unknown column `salary`",
            Some("SELECT salary FROM t".to_string()),
        );
        let shown = err.to_string();
        assert!(shown.contains("unknown column"));
        assert!(!shown.contains("SELECT"));
        assert!(!err.user_message().contains("salary"));
        assert_eq!(err.stage(), Stage::Synthesis);
    }

    #[test]
    fn stages_are_assigned() {
        assert_eq!(
            EngineError::InvalidInput("empty".into()).stage(),
            Stage::Input
        );
        assert_eq!(
            EngineError::EmbeddingService("x".into()).stage(),
            Stage::Retrieval
        );
        assert_eq!(
            EngineError::QueryExecution("x".into()).stage(),
            Stage::Execution
        );
        assert_eq!(EngineError::CatalogLoad("x".into()).stage(), Stage::Startup);
    }

    #[test]
    fn redact_removes_secrets() {
        let msg = "password authentication failed for hunter2 at db";
        assert_eq!(
            redact(msg, &["hunter2", ""]),
            "password authentication failed for **** at db"
        );
    }
}
