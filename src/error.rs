//! Error taxonomy shared by the pipeline components.
//!
//! Each component boundary has its own enum. Adapter failures are classified into
//! `SourceError` and absorbed by the aggregator; only `SearchError::AllSourcesFailed`
//! escapes a search.

use thiserror::Error;

use crate::model::SourceId;

/// Failure of a single upstream fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source timed out after {0} ms")]
    Timeout(u64),

    #[error("source rate limited")]
    RateLimited,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl SourceError {
    /// Short, stable label for metrics and `sources_failed` annotations.
    pub fn reason(&self) -> &'static str {
        match self {
            SourceError::Timeout(_) => "timeout",
            SourceError::RateLimited => "rate_limited",
            SourceError::Upstream(_) => "upstream",
            SourceError::InvalidQuery(_) => "invalid_query",
        }
    }

    /// Whether the aggregator may retry the same source within one invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Timeout(_) | SourceError::Upstream(_))
    }
}

/// Failure of one aggregator invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("all sources failed: {}", describe_failures(.0))]
    AllSourcesFailed(Vec<(SourceId, String)>),

    #[error("search canceled")]
    Canceled,

    #[error("search timed out after {0} ms")]
    Timeout(u64),
}

fn describe_failures(f: &[(SourceId, String)]) -> String {
    f.iter()
        .map(|(s, r)| format!("{s}={r}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Persistence collaborator failure. Always treated as retryable infrastructure trouble.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("quota exceeded for {metric}")]
    QuotaExceeded { metric: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task expired: {0}")]
    Expired(String),

    #[error("task queue closed")]
    QueueClosed,

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("quota exceeded: {active} active monitors, limit {limit}")]
    QuotaExceeded { active: u64, limit: u64 },

    #[error("monitor not found: {0}")]
    NotFound(u64),

    #[error("invalid monitor settings: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_source_errors_retry() {
        assert!(SourceError::Timeout(100).is_retryable());
        assert!(SourceError::Upstream("502".into()).is_retryable());
        assert!(!SourceError::RateLimited.is_retryable());
        assert!(!SourceError::InvalidQuery("bad date".into()).is_retryable());
    }

    #[test]
    fn all_failed_lists_every_source() {
        let e = SearchError::AllSourcesFailed(vec![
            (SourceId::Primary, "timeout".into()),
            (SourceId::Alternate, "rate_limited".into()),
        ]);
        let msg = e.to_string();
        assert!(msg.contains("flight_engine_a=timeout"));
        assert!(msg.contains("flight_engine_b=rate_limited"));
    }
}
