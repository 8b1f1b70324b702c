//! Shared test doubles for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use scanforge_llm::{
    CompletionRequest, CompletionResponse, LlmError, LlmProvider, ProviderInfo,
};
use scanforge_runner::{
    ContainerRuntime, ContainerSpec, ContainerState, LogCapture, RuntimeError,
};

/// Poll until `probe` returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(mut probe: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// LLM provider fed from a scripted queue of responses.
pub struct FakeLlm {
    responses: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub async fn prompt_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "fake",
            name: "Fake",
        }
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.prompts.lock().await.push(request.prompt.clone());
        let next = self.responses.lock().await.pop_front();
        match next {
            Some(text) => Ok(CompletionResponse {
                text,
                model: "fake-model".into(),
            }),
            None => Err(LlmError::ServiceUnavailable("script exhausted".into())),
        }
    }
}

// ── Script-driven container runtime ──────────────────────────────────

type ScriptFn = dyn Fn(&ContainerSpec) -> (Vec<u8>, i64) + Send + Sync;

struct FakeContainer {
    state: ContainerState,
    stdout: Vec<u8>,
    spec: ContainerSpec,
}

/// Container runtime whose log output is computed from the container
/// spec, so validation scans can react to which template they run.
pub struct ResponsiveRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    script: Box<ScriptFn>,
}

impl ResponsiveRuntime {
    pub fn new(
        script: impl Fn(&ContainerSpec) -> (Vec<u8>, i64) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            script: Box::new(script),
        })
    }

    pub async fn live_count(&self) -> usize {
        self.containers.lock().await.len()
    }
}

#[async_trait]
impl ContainerRuntime for ResponsiveRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_present(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::AlreadyExists(spec.name.clone()));
        }
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                state: ContainerState::Created,
                stdout: Vec::new(),
                spec: spec.clone(),
            },
        );
        Ok(format!("fake-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let (stdout, exit_code) = (self.script)(&container.spec);
        container.stdout = stdout;
        container.state = ContainerState::Exited(exit_code);
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<LogCapture, RuntimeError> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(LogCapture {
            stdout: container.stdout.clone(),
            stderr: Vec::new(),
        })
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let containers = self.containers.lock().await;
        match containers.get(name) {
            Some(container) => match container.state {
                ContainerState::Exited(code) => Ok(code),
                _ => Err(RuntimeError::CommandFailed("still running".into())),
            },
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().await;
        if containers.remove(name).is_none() {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        let containers = self.containers.lock().await;
        Ok(containers
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }
}
