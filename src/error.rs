use std::time::Duration;

use thiserror::Error;

/// Failures of the detection pipeline.
///
/// Every variant is contained at the granularity it names: a sport category,
/// a market, a trader or a single alert. Only a global deadline or a total
/// source outage ends a cycle early.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("source unavailable ({source_name}): {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("partial read of market {market_id}: {skipped} trader(s) unreadable")]
    PartialRead { market_id: String, skipped: usize },

    #[error("profile for {wallet} is stale and could not be refreshed: {reason}")]
    ClassificationStale { wallet: String, reason: String },

    #[error("alert sink failure (retryable: {retryable}): {reason}")]
    SinkFailure { retryable: bool, reason: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl TrackerError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        TrackerError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timed_out(source_name: impl Into<String>, after: Duration) -> Self {
        TrackerError::SourceUnavailable {
            source_name: source_name.into(),
            reason: format!("timed out after {after:?}"),
        }
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Run a source call under a timeout, mapping expiry to `SourceUnavailable`.
pub async fn with_timeout<T, F>(source_name: &str, limit: Duration, fut: F) -> TrackerResult<T>
where
    F: std::future::Future<Output = TrackerResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::timed_out(source_name, limit)),
    }
}
