//! LLM-specific error types
//!
//! Provides typed errors for LLM operations, enabling better error handling
//! and recovery strategies.

use std::fmt;

/// LLM operation error
#[derive(Debug)]
pub enum LlmError {
    /// Request was invalid (bad parameters, empty prompt, etc.)
    InvalidRequest(String),

    /// Model not found or not available at the endpoint
    ModelNotFound(String),

    /// Network/connection error
    Network(String),

    /// Request timed out
    Timeout {
        /// Timeout duration in seconds
        seconds: u64,
    },

    /// Service temporarily unavailable
    ServiceUnavailable(String),

    /// Endpoint returned an unexpected response
    InvalidResponse(String),

    /// Configuration error
    Configuration(String),
}

impl LlmError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::Timeout { .. } | LlmError::ServiceUnavailable(_)
        )
    }

    /// Create a timeout error
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            LlmError::ModelNotFound(model) => write!(f, "Model not found: {}", model),
            LlmError::Network(msg) => write!(f, "Network error: {}", msg),
            LlmError::Timeout { seconds } => write!(f, "Request timed out after {}s", seconds),
            LlmError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            LlmError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            LlmError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout { seconds: 0 }
        } else if err.is_connect() {
            LlmError::Network(format!("Connection failed: {}", err))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(format!("JSON parse error: {}", err))
    }
}
