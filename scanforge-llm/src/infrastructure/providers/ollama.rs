//! Ollama-compatible provider implementation
//!
//! Talks to an Ollama `/api/generate` endpoint, which also fronts other
//! local model servers exposing the same shape.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::domain::{
    CompletionRequest, CompletionResponse, LlmError, LlmProvider, ProviderInfo,
};

/// Ollama-compatible provider
pub struct OllamaProvider {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OllamaProvider {
    /// Create a new provider against the given generate endpoint.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build HTTP client with custom timeout, using default client");
                Client::new()
            });

        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            timeout,
        }
    }

    fn to_ollama_request(&self, request: &CompletionRequest) -> OllamaRequest {
        OllamaRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            prompt: request.prompt.clone(),
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                seed: request.seed,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "ollama",
            name: "Ollama",
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidRequest("empty prompt".to_string()));
        }

        let body = self.to_ollama_request(&request);
        debug!(model = %body.model, endpoint = %self.endpoint, "Sending completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::timeout(self.timeout.as_secs())
                } else {
                    LlmError::from(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(LlmError::ModelNotFound(body.model));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ServiceUnavailable(format!("{}: {}", status, text)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::InvalidRequest(format!("{}: {}", status, text)));
        }

        let parsed: OllamaResponse = response.json().await.map_err(LlmError::from)?;
        if parsed.response.trim().is_empty() {
            return Err(LlmError::InvalidResponse(
                "model returned an empty completion".to_string(),
            ));
        }

        Ok(CompletionResponse {
            text: parsed.response,
            model: parsed.model.unwrap_or(body.model),
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
    model: Option<String>,
}
