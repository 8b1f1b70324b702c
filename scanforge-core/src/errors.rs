//! Error taxonomy shared across all scanforge components.
//!
//! Every task handler resolves its layer-specific error into a [`CoreError`]
//! before it reaches the scheduler, which uses [`CoreError::retryable`] to
//! decide between a retry and a terminal failure.

use serde::{Deserialize, Serialize};

/// Top-level error taxonomy.
///
/// The variants mirror the failure classes the service distinguishes:
/// caller errors are surfaced as-is, transient infrastructure failures are
/// retried with backoff, and everything else is terminal.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoreError {
    /// Caller error; surfaced to the API collaborator, never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Task exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Container runtime is unreachable or refused the request.
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// LLM endpoint is unreachable or returned a transport-level failure.
    #[error("LLM endpoint unavailable: {0}")]
    LlmUnavailable(String),

    /// CVE feed is unreachable or returned a transport-level failure.
    #[error("CVE feed unavailable: {0}")]
    FeedUnavailable(String),

    /// KV store is unreachable.
    #[error("KV store unavailable: {0}")]
    KvUnavailable(String),

    /// Scanner or LLM produced output we could not parse.
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    /// The scan output degenerated into a repeating loop; terminal.
    #[error("Log loop detected: {0}")]
    LoopDetected(String),

    /// Synthesized on recovery for jobs whose worker stopped heartbeating.
    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Per-queue soft cap exceeded; the caller should shed load.
    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the scheduler may retry a task that failed with this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_)
                | CoreError::RuntimeUnavailable(_)
                | CoreError::LlmUnavailable(_)
                | CoreError::FeedUnavailable(_)
                | CoreError::KvUnavailable(_)
        )
    }

    /// Short machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Timeout(_) => "timeout",
            CoreError::RuntimeUnavailable(_) => "runtime_unavailable",
            CoreError::LlmUnavailable(_) => "llm_unavailable",
            CoreError::FeedUnavailable(_) => "feed_unavailable",
            CoreError::KvUnavailable(_) => "kv_unavailable",
            CoreError::InvalidOutput(_) => "invalid_output",
            CoreError::LoopDetected(_) => "loop_detected",
            CoreError::WorkerLost(_) => "worker_lost",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::QueueFull(_) => "queue_full",
            CoreError::Internal(_) => "internal",
        }
    }
}
