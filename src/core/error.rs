use std::time::Duration;

use thiserror::Error;

/// Error surface for one engine invocation.
///
/// Engine-local errors never escape `SearchEngine::run` — they degrade to an
/// empty result plus a recorded metric. The variants exist so the retry loop
/// and the metrics sink can tell the failure modes apart.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The engine signaled throttling (HTTP 429/503 or an explicit block
    /// body). Retryable; drives the adaptive tracker.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },

    /// Network / DNS / TLS failure. Not retryable here.
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing or rejected credentials. The engine is unavailable for the
    /// rest of the run.
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// Soft per-phase budget exceeded. Not retryable.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative stop. Not an error to the caller.
    #[error("cancelled")]
    Cancelled,

    /// LLM failure during filtering or synthesis.
    #[error("llm error: {0}")]
    Llm(String),

    /// Local index I/O failure; the affected folder is skipped.
    #[error("index error: {0}")]
    Index(String),

    /// Engine misconfiguration detected at construction or first use.
    #[error("engine misconfigured: {0}")]
    Config(String),
}

impl SearchError {
    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Stable label used for the tracker's attempt log and metric rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limit",
            Self::Transport(_) => "transport",
            Self::Auth(_) => "auth",
            Self::Parse(_) => "parse",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Llm(_) => "llm",
            Self::Index(_) => "index",
            Self::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the configured budget here.
            Self::Timeout(Duration::from_secs(30))
        } else if e.is_connect() {
            Self::Transport(format!("connect: {e}"))
        } else if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(SearchError::rate_limited("429").kind(), "rate_limit");
        assert_eq!(SearchError::Cancelled.kind(), "cancelled");
        assert_eq!(
            SearchError::Timeout(Duration::from_secs(1)).kind(),
            "timeout"
        );
    }

    #[test]
    fn rate_limit_predicate() {
        assert!(SearchError::rate_limited("http_429").is_rate_limit());
        assert!(!SearchError::Transport("dns".into()).is_rate_limit());
    }
}
