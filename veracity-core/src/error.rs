//! Error types for the Veracity research core.
//!
//! Uses `thiserror` for public API error types. The taxonomy follows how a
//! failure propagates through the pipeline: per-item errors (`FetchError`,
//! `AgentError::OutputParse`) are isolated by the caller, while provider
//! exhaustion and phase faults escalate to a terminal session error.

use std::time::Duration;

use crate::research::session::ResearchPhase;

/// Top-level error type for the Veracity core library.
#[derive(Debug, thiserror::Error)]
pub enum VeracityError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors from external capability providers (search, LLM, embedding, NLI).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned an unparsable response: {message}")]
    ResponseParse { provider: String, message: String },

    #[error("{provider} rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Connection to {provider} failed: {message}")]
    Connection { provider: String, message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("{provider} rejected the request (HTTP {status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    /// Every provider in a fallback chain failed or was skipped.
    #[error("All {capability} providers unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable {
        capability: String,
        attempts: usize,
        last_error: String,
    },
}

/// Per-URL crawl failures. Never escalates past the crawler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Fetching {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("Unsupported content type {content_type} at {url}")]
    UnsupportedContent { url: String, content_type: String },

    #[error("No usable text at {url} ({chars} chars)")]
    EmptyContent { url: String, chars: usize },
}

/// Errors produced by research agents.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("{agent} produced malformed output: {message}")]
    OutputParse { agent: String, message: String },

    #[error("{agent} does not handle task {task}")]
    UnsupportedTask { agent: String, task: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Phase-level failures. Any of these moves the session to ERROR.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PhaseError {
    #[error("{phase} failed: {message}")]
    Failed { phase: ResearchPhase, message: String },

    #[error("{phase} exceeded its {deadline_secs}s deadline")]
    DeadlineExceeded {
        phase: ResearchPhase,
        deadline_secs: u64,
    },

    #[error("Session cancelled during {phase}")]
    Cancelled { phase: ResearchPhase },

    #[error("{phase}: external provider unavailable: {source}")]
    ProviderUnavailable {
        phase: ResearchPhase,
        #[source]
        source: ProviderError,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: ResearchPhase,
        to: ResearchPhase,
    },
}

impl PhaseError {
    pub fn failed(phase: ResearchPhase, message: impl Into<String>) -> Self {
        Self::Failed {
            phase,
            message: message.into(),
        }
    }

    /// Short machine-readable cause, carried in `error` events.
    pub fn cause(&self) -> &'static str {
        match self {
            PhaseError::Failed { .. } => "pipeline_phase_failure",
            PhaseError::DeadlineExceeded { .. } => "phase_deadline_exceeded",
            PhaseError::Cancelled { .. } => "cancelled",
            PhaseError::ProviderUnavailable { .. } => "external_provider_unavailable",
            PhaseError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {id}")]
    NotFound { id: uuid::Uuid },

    #[error("Failed to persist session {id}: {source}")]
    Persist {
        id: uuid::Uuid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load sessions from {path}: {source}")]
    Load {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Retry classification shared by every error that crosses an external call.
pub trait Retryable: std::fmt::Display {
    /// Whether a retry could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// How many retries this particular failure deserves, given the policy default.
    fn retry_budget(&self, default: u32) -> u32 {
        if self.is_retryable() { default } else { 0 }
    }

    /// Server-requested wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Construct the timeout variant for an operation that exceeded its deadline.
    fn timed_out(operation: &str, after: Duration) -> Self
    where
        Self: Sized;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Connection { .. }
                | ProviderError::Request { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        ProviderError::Timeout {
            operation: operation.to_string(),
            timeout_ms: after.as_millis() as u64,
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            FetchError::Timeout { .. } | FetchError::Network { .. } => true,
            _ => false,
        }
    }

    /// 429 gets three retries and 503 two; other transient failures use the policy default.
    fn retry_budget(&self, default: u32) -> u32 {
        match self {
            FetchError::Status { status: 429, .. } => 3,
            FetchError::Status { status: 503, .. } => 2,
            other if other.is_retryable() => default,
            _ => 0,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        FetchError::Timeout {
            url: operation.to_string(),
            timeout_ms: after.as_millis() as u64,
        }
    }
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        AgentError::Provider(ProviderError::timed_out(operation, after))
    }
}

/// Convenience type alias for Veracity results.
pub type Result<T> = std::result::Result<T, VeracityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_unavailable_display() {
        let err = ProviderError::Unavailable {
            capability: "search".into(),
            attempts: 2,
            last_error: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "All search providers unavailable after 2 attempt(s): connection refused"
        );
    }

    #[test]
    fn test_fetch_retry_budgets() {
        let too_many = FetchError::Status {
            url: "https://a.test".into(),
            status: 429,
        };
        let unavailable = FetchError::Status {
            url: "https://a.test".into(),
            status: 503,
        };
        let missing = FetchError::Status {
            url: "https://a.test".into(),
            status: 404,
        };
        assert_eq!(too_many.retry_budget(1), 3);
        assert_eq!(unavailable.retry_budget(1), 2);
        assert_eq!(missing.retry_budget(5), 0);
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_phase_error_cause() {
        let err = PhaseError::ProviderUnavailable {
            phase: ResearchPhase::Searching,
            source: ProviderError::Unavailable {
                capability: "search".into(),
                attempts: 1,
                last_error: "down".into(),
            },
        };
        assert_eq!(err.cause(), "external_provider_unavailable");
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn test_rate_limited_retry_after() {
        let err = ProviderError::RateLimited {
            provider: "openai".into(),
            retry_after_secs: 7,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_failure_not_retryable() {
        let err = ProviderError::AuthFailed {
            provider: "openai".into(),
        };
        assert!(!err.is_retryable());
        let agent: AgentError = err.into();
        assert!(!agent.is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let err: VeracityError = PhaseError::Cancelled {
            phase: ResearchPhase::Crawling,
        }
        .into();
        assert!(matches!(err, VeracityError::Phase(_)));
    }
}
