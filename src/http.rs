//! JSON-over-HTTP calls to external model services with bounded retry.
//!
//! Retry strategy, shared by the embedding and completion providers:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s (at most `max_retries` extra attempts)

use anyhow::{bail, Result};
use std::time::Duration;

/// A JSON POST endpoint of an external service.
pub struct JsonEndpoint<'a> {
    pub client: &'a reqwest::Client,
    pub url: String,
    pub bearer: Option<&'a str>,
    /// Label used in error messages, e.g. `"OpenAI embeddings"`.
    pub service: &'a str,
    pub max_retries: u32,
}

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

impl JsonEndpoint<'_> {
    pub async fn post(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(service = self.service, attempt, ?delay, "retrying");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(token) = self.bearer {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(service = self.service, %status, "transient service error");
                        last_err = Some(anyhow::anyhow!(
                            "{} error {}: {}",
                            self.service,
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("{} error {}: {}", self.service, status, body_text);
                }
                Err(e) => {
                    let kind = if e.is_timeout() { "timed out" } else { "unreachable" };
                    tracing::warn!(service = self.service, error = %e, "request {}", kind);
                    last_err = Some(anyhow::anyhow!("{} {}: {}", self.service, kind, e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", self.service)))
    }
}
