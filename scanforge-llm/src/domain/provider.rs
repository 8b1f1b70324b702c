//! LLM Provider trait
//!
//! Defines the core abstraction for LLM providers. The pipeline only ever
//! sees `Arc<dyn LlmProvider>`, so tests can substitute scripted fakes.

use async_trait::async_trait;

use crate::domain::error::LlmError;
use crate::domain::messages::{CompletionRequest, CompletionResponse};

/// Metadata about a provider
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Provider identifier (e.g. "ollama")
    pub id: &'static str,
    /// Human-readable name
    pub name: &'static str,
}

/// Core trait for LLM providers
///
/// Object-safe; used with dynamic dispatch via `Arc<dyn LlmProvider>`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get provider metadata
    fn info(&self) -> ProviderInfo;

    /// Generate a completion
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Check if the provider is healthy and can accept requests
    async fn health_check(&self) -> Result<(), LlmError> {
        // Default implementation: try a minimal completion
        let request = CompletionRequest::new("ping").with_temperature(0.0);
        self.complete(request).await.map(|_| ())
    }

    /// Get the default model for this provider
    fn default_model(&self) -> &str;
}
