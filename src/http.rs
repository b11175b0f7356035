//! JSON-over-HTTP calls to model providers, with retry and backoff.
//!
//! Shared by the embedding and reasoning clients. Failures are mapped onto
//! the pipeline's error taxonomy so the task ledger knows whether to retry:
//!
//! - HTTP 429 and 5xx → retried here, then [`PipelineError::TransientProvider`]
//! - other HTTP 4xx → [`PipelineError::PermanentInput`], never retried
//! - network errors and timeouts → retried here, then transient
//!
//! Backoff between attempts is 1s, 2s, 4s, ... capped at 32s.

use anyhow::Result;
use casesheet_core::error::PipelineError;
use std::time::Duration;
use tracing::{debug, warn};

/// A provider endpoint and how hard to try it.
pub struct JsonEndpoint<'a> {
    pub client: &'a reqwest::Client,
    pub service: &'a str,
    pub url: String,
    pub bearer: Option<&'a str>,
    pub max_retries: u32,
}

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

impl JsonEndpoint<'_> {
    /// POST `body` and return the decoded JSON response.
    pub async fn post(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(service = self.service, attempt, ?delay, "retrying provider call");
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
                        return response.json().await.map_err(|e| {
                            PipelineError::TransientProvider(format!(
                                "{} returned an unreadable body: {}",
                                self.service, e
                            ))
                            .into()
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(service = self.service, %status, "provider call failed");
                        last_err = Some(format!("{} API error {}: {}", self.service, status, body_text));
                        continue;
                    }

                    return Err(PipelineError::PermanentInput(format!(
                        "{} API error {}: {}",
                        self.service, status, body_text
                    ))
                    .into());
                }
                Err(e) => {
                    warn!(service = self.service, error = %e, "provider unreachable");
                    last_err = Some(format!(
                        "{} connection error ({}): {}",
                        self.service, self.url, e
                    ));
                    continue;
                }
            }
        }

        Err(PipelineError::TransientProvider(
            last_err.unwrap_or_else(|| format!("{} call failed after retries", self.service)),
        )
        .into())
    }
}
