use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{TrackerError, TrackerResult};

/// Destination for formatted alerts.
pub trait AlertSink {
    async fn post(&self, text: &str) -> TrackerResult<()>;

    /// Whether posts reach a real audience (false for dry-run sinks).
    fn is_live(&self) -> bool {
        true
    }
}

/// Post with an upper bound on latency. Expiry counts as a retryable failure.
pub async fn post_with_timeout<K: AlertSink>(
    sink: &K,
    text: &str,
    limit: Duration,
) -> TrackerResult<()> {
    match tokio::time::timeout(limit, sink.post(text)).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::SinkFailure {
            retryable: true,
            reason: format!("timed out after {limit:?}"),
        }),
    }
}

/// Map a non-success HTTP status to a sink failure.
///
/// 429 and 5xx are transient; any other status will fail again unchanged.
pub fn status_failure(status: u16, body: &str) -> TrackerError {
    let retryable = status == 429 || (500..600).contains(&status);
    TrackerError::SinkFailure {
        retryable,
        reason: format!("status {status}: {body}"),
    }
}

#[derive(Serialize)]
struct TextPayload<'a> {
    content: &'a str,
}

/// Discord/Slack-compatible webhook (`{"content": "..."}`).
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::SinkFailure {
                retryable: false,
                reason: format!("cannot build http client: {e}"),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookSink {
    async fn post(&self, text: &str) -> TrackerResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&TextPayload { content: text })
            .send()
            .await
            .map_err(|e| TrackerError::SinkFailure {
                retryable: e.is_timeout() || e.is_connect(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!("Webhook accepted alert ({status})");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_failure(status.as_u16(), &body))
    }
}

/// Dry-run sink: logs what would have been posted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AlertSink for LogSink {
    async fn post(&self, text: &str) -> TrackerResult<()> {
        info!("[DRY RUN] would have posted:\n{text}");
        Ok(())
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// Sink chosen at startup from `--live` / `--dry-run`.
pub enum ConfiguredSink {
    Live(WebhookSink),
    DryRun(LogSink),
}

impl AlertSink for ConfiguredSink {
    async fn post(&self, text: &str) -> TrackerResult<()> {
        match self {
            ConfiguredSink::Live(sink) => sink.post(text).await,
            ConfiguredSink::DryRun(sink) => sink.post(text).await,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, ConfiguredSink::Live(_))
    }
}
