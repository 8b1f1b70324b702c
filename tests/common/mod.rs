//! Shared test doubles for service-level end-to-end tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use scanforge_llm::{CompletionRequest, CompletionResponse, LlmError, LlmProvider, ProviderInfo};
use scanforge_runner::{ContainerRuntime, ContainerSpec, ContainerState, LogCapture, RuntimeError};

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
}

impl FakeLlm {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        })
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

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.responses.lock().await.pop_front() {
            Some(text) => Ok(CompletionResponse {
                text,
                model: "fake-model".into(),
            }),
            None => Err(LlmError::ServiceUnavailable("script exhausted".into())),
        }
    }
}

// ── Scripted container runtime ───────────────────────────────────────

type ScriptFn = dyn Fn(&ContainerSpec) -> (Vec<u8>, i64) + Send + Sync;

struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
    stdout: Vec<u8>,
}

#[derive(Default)]
struct RuntimeState {
    containers: HashMap<String, FakeContainer>,
    removed: Vec<String>,
}

/// Container runtime whose log output is computed from the container
/// spec; `hold` keeps containers running until force-removed.
pub struct ScriptedRuntime {
    state: Mutex<RuntimeState>,
    exited: Notify,
    script: Box<ScriptFn>,
    pub hold: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new(
        script: impl Fn(&ContainerSpec) -> (Vec<u8>, i64) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState::default()),
            exited: Notify::new(),
            script: Box::new(script),
            hold: AtomicBool::new(false),
        })
    }

    /// Fixed script for every container.
    pub fn fixed(stdout: &str, exit_code: i64) -> Arc<Self> {
        let stdout = stdout.as_bytes().to_vec();
        Self::new(move |_| (stdout.clone(), exit_code))
    }

    pub async fn container_names(&self) -> Vec<String> {
        self.state.lock().await.containers.keys().cloned().collect()
    }

    pub async fn removed_names(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
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
        let mut state = self.state.lock().await;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::AlreadyExists(spec.name.clone()));
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
                stdout: Vec::new(),
            },
        );
        Ok(format!("fake-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let (stdout, exit_code) = (self.script)(&container.spec);
        container.stdout = stdout;
        container.state = if self.hold.load(Ordering::SeqCst) {
            ContainerState::Running
        } else {
            ContainerState::Exited(exit_code)
        };
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<LogCapture, RuntimeError> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(LogCapture {
            stdout: container.stdout.clone(),
            stderr: Vec::new(),
        })
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        loop {
            {
                let state = self.state.lock().await;
                match state.containers.get(name) {
                    None => return Err(RuntimeError::NotFound(name.to_string())),
                    Some(container) => {
                        if let ContainerState::Exited(code) = container.state {
                            return Ok(code);
                        }
                    }
                }
            }
            self.exited.notified().await;
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        if state.containers.remove(name).is_none() {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        state.removed.push(name.to_string());
        drop(state);
        self.exited.notify_waiters();
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }
}
