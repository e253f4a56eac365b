//! Question → SQL synthesis.
//!
//! The synthesizer prompts the completion service with the question, the
//! retrieved candidate variables, and the table layout, then pulls one SQL
//! statement out of the reply and runs it through [`validate`].
//!
//! When validation fails the model gets `repair_attempts` corrective
//! re-prompts that quote the violation. Nothing that failed validation is
//! ever returned; the last rejection is surfaced as
//! [`EngineError::UnsafeQuery`].
//!
//! A reply of `NO_QUERY` means the model judged the question unanswerable
//! from the table; this is also reported as `UnsafeQuery` (without SQL).

use regex::Regex;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use crate::completion::{ChatMessage, CompletionProvider};
use crate::error::EngineError;
use crate::models::{ColumnRole, RetrievalResult, SchemaDescriptor};
use crate::validate::{validate, SynthesizedQuery};

/// Marker the model is told to reply with when no query answers the question.
pub const NO_QUERY: &str = "NO_QUERY";

pub struct QuerySynthesizer {
    provider: Arc<dyn CompletionProvider>,
    repair_attempts: u32,
}

impl QuerySynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, repair_attempts: u32) -> Self {
        Self {
            provider,
            repair_attempts,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Produce a validated query answering `question`.
    pub async fn synthesize(
        &self,
        question: &str,
        variables: &RetrievalResult,
        schema: &SchemaDescriptor,
    ) -> Result<SynthesizedQuery, EngineError> {
        let mut messages = build_prompt(question, variables, schema);
        let mut attempt = 0u32;

        loop {
            let reply = self
                .provider
                .complete(&messages)
                .await
                .map_err(|e| EngineError::CompletionService(format!("{:#}", e)))?;

            let sql = extract_sql(&reply).ok_or_else(|| {
                EngineError::unsafe_query("the question cannot be answered from this table", None)
            })?;

            let err = match validate(&sql, schema) {
                Ok(query) => {
                    tracing::debug!(attempt, sql = %query.sql_text(), "query synthesized");
                    return Ok(query);
                }
                Err(err) => err,
            };

            if let EngineError::UnsafeQuery { reason, .. } = &err {
                tracing::warn!(attempt, %reason, %sql, "generated SQL rejected");
            }
            if attempt >= self.repair_attempts {
                return Err(err);
            }
            attempt += 1;

            messages.push(ChatMessage::assistant(reply));
            messages.push(ChatMessage::user(repair_message(&err, schema)));
        }
    }
}

/// Chat messages for the first synthesis attempt.
pub fn build_prompt(
    question: &str,
    variables: &RetrievalResult,
    schema: &SchemaDescriptor,
) -> Vec<ChatMessage> {
    let mut system = String::new();
    let _ = writeln!(
        system,
        "You translate questions about census statistics into one {} query.",
        schema.dialect.display_name()
    );
    let _ = writeln!(system, "Rules:");
    let _ = writeln!(system, "- Write exactly one read-only SELECT statement.");
    let _ = writeln!(system, "- Query only the table `{}`.", schema.table);
    let _ = writeln!(
        system,
        "- Always select the region id column `{}` and the geometry column `{}`.",
        schema.id_column, schema.geometry_column
    );
    let _ = writeln!(
        system,
        "- Use only the columns listed below. Quote string literals with single quotes."
    );
    let _ = writeln!(
        system,
        "- Put the value to map right after the id column, with a short alias."
    );
    let _ = writeln!(
        system,
        "- Reply with the SQL only. If the table cannot answer the question, reply {}.",
        NO_QUERY
    );

    let mut user = String::new();
    let _ = writeln!(user, "Table: {}", schema.table);
    let _ = writeln!(user, "Region id column: {}", schema.id_column);
    let _ = writeln!(user, "Geometry column: {}", schema.geometry_column);

    let attributes: Vec<&str> = schema
        .columns
        .iter()
        .filter(|c| c.role == ColumnRole::Attribute)
        .map(|c| c.name.as_str())
        .collect();
    if !attributes.is_empty() {
        let _ = writeln!(user, "Other descriptive columns: {}", attributes.join(", "));
    }

    let _ = writeln!(user, "\nCandidate variables (column: description):");
    if variables.is_empty() {
        let _ = writeln!(user, "(none)");
    }
    for scored in &variables.items {
        let _ = writeln!(
            user,
            "- {}: {}",
            scored.variable.name, scored.variable.description
        );
    }

    let _ = writeln!(user, "\nQuestion: {}", question);

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn repair_message(err: &EngineError, schema: &SchemaDescriptor) -> String {
    let reason = match err {
        EngineError::UnsafeQuery { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    format!(
        "That query was rejected: {}. Write a corrected single SELECT on `{}` that selects `{}` and `{}`, using only the listed columns. Reply with the SQL only.",
        reason, schema.table, schema.id_column, schema.geometry_column
    )
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?is)```[a-z]*\s*(.*?)```").unwrap())
}

fn statement_start() -> &'static Regex {
    static START: OnceLock<Regex> = OnceLock::new();
    START.get_or_init(|| Regex::new(r"(?i)\b(select|with)\b").unwrap())
}

fn select_keyword() -> &'static Regex {
    static SELECT: OnceLock<Regex> = OnceLock::new();
    SELECT.get_or_init(|| Regex::new(r"(?i)\bselect\b").unwrap())
}

/// Pull the SQL statement out of a model reply.
///
/// Returns `None` when the reply is the [`NO_QUERY`] marker (or empty).
/// Fenced code blocks win; otherwise text before the first `SELECT`/`WITH`
/// is dropped. Trailing semicolons are removed.
pub fn extract_sql(reply: &str) -> Option<String> {
    let body = match fence_pattern().captures(reply) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
        None => reply,
    };

    if body.contains(NO_QUERY) && !select_keyword().is_match(body) {
        return None;
    }

    let sql = match statement_start().find(body) {
        Some(m) => &body[m.start()..],
        None => body,
    };

    let sql = sql.trim().trim_end_matches(';').trim_end();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Role;
    use crate::models::{ScoredVariable, SchemaColumn, SqlDialect, VariableRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn schema() -> SchemaDescriptor {
        let col = |name: &str, role| SchemaColumn {
            name: name.to_string(),
            role,
            description: None,
        };
        SchemaDescriptor {
            table: "censo".into(),
            dialect: SqlDialect::Sqlite,
            geometry_column: "geom".into(),
            id_column: "dicofre".into(),
            columns: vec![
                col("dicofre", ColumnRole::Id),
                col("geom", ColumnRole::Geometry),
                col("municipio", ColumnRole::Attribute),
                col("pct_women", ColumnRole::Variable),
            ],
            max_rows: 500,
        }
    }

    fn variables() -> RetrievalResult {
        RetrievalResult {
            items: vec![ScoredVariable {
                variable: VariableRecord {
                    name: "pct_women".into(),
                    description: "Percentage of women".into(),
                    embedding: vec![1.0],
                },
                score: 0.9,
            }],
        }
    }

    /// Replies with canned answers in order and records every prompt.
    struct Scripted {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no more replies"))
        }
    }

    #[test]
    fn prompt_lists_candidates_and_table() {
        let messages = build_prompt("Where do most women live?", &variables(), &schema());
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("SQLite"));
        assert!(messages[0].content.contains(NO_QUERY));
        let user = &messages[1].content;
        assert!(user.contains("pct_women: Percentage of women"));
        assert!(user.contains("Table: censo"));
        assert!(user.contains("Other descriptive columns: municipio"));
        assert!(user.contains("Question: Where do most women live?"));
    }

    #[test]
    fn extracts_from_fences_and_prose() {
        assert_eq!(
            extract_sql("```sql\nSELECT dicofre, geom FROM censo;\n```").unwrap(),
            "SELECT dicofre, geom FROM censo"
        );
        assert_eq!(
            extract_sql("Here you go: SELECT 1;").unwrap(),
            "SELECT 1"
        );
        assert_eq!(
            extract_sql("with t as (select 1) select * from t").unwrap(),
            "with t as (select 1) select * from t"
        );
        assert!(extract_sql("NO_QUERY").is_none());
        assert!(extract_sql("Nothing to do with census data. NO_QUERY").is_none());
        assert!(extract_sql("   ").is_none());
    }

    #[tokio::test]
    async fn valid_first_answer_is_returned() {
        let provider = Scripted::new(&["SELECT dicofre, geom, pct_women FROM censo"]);
        let synth = QuerySynthesizer::new(provider.clone(), 1);
        let query = synth
            .synthesize("women", &variables(), &schema())
            .await
            .unwrap();
        assert!(query.sql_text().contains("LIMIT 500"));
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_answer_gets_one_repair() {
        let provider = Scripted::new(&[
            "SELECT dicofre, geom, pct_unicorns FROM censo",
            "SELECT dicofre, geom, pct_women FROM censo",
        ]);
        let synth = QuerySynthesizer::new(provider.clone(), 1);
        let query = synth
            .synthesize("women", &variables(), &schema())
            .await
            .unwrap();
        assert!(query.sql_text().contains("pct_women"));

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let repair = &seen[1];
        assert_eq!(repair.len(), 4);
        assert_eq!(repair[2].role, Role::Assistant);
        assert!(repair[3].content.contains("pct_unicorns"));
    }

    #[tokio::test]
    async fn persistent_violation_is_unsafe() {
        let provider = Scripted::new(&[
            "DELETE FROM censo",
            "DROP TABLE censo",
        ]);
        let synth = QuerySynthesizer::new(provider, 1);
        let err = synth
            .synthesize("women", &variables(), &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsafeQuery { .. }));
    }

    #[tokio::test]
    async fn no_repair_when_disabled() {
        let provider = Scripted::new(&["SELECT nope FROM censo", "SELECT dicofre, geom FROM censo"]);
        let synth = QuerySynthesizer::new(provider.clone(), 0);
        assert!(synth
            .synthesize("women", &variables(), &schema())
            .await
            .is_err());
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_query_marker_is_unsafe_without_sql() {
        let provider = Scripted::new(&["NO_QUERY"]);
        let synth = QuerySynthesizer::new(provider, 1);
        match synth.synthesize("life on Mars", &variables(), &schema()).await {
            Err(EngineError::UnsafeQuery { sql, .. }) => assert!(sql.is_none()),
            other => panic!("expected UnsafeQuery, got {:?}", other.map(|q| q.sql_text().to_string())),
        }
    }

    #[tokio::test]
    async fn service_failure_is_completion_error() {
        let provider = Scripted::new(&[]);
        let synth = QuerySynthesizer::new(provider, 1);
        let err = synth
            .synthesize("women", &variables(), &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CompletionService(_)));
    }
}
