//! Shared test doubles for orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use scanforge_core::CoreError;
use scanforge_core::config::SchedulerConfig;
use scanforge_orchestrator::{TaskContext, TaskHandler};
use scanforge_runner::{
    ContainerRuntime, ContainerSpec, ContainerState, LogCapture, RuntimeError,
};

/// Scheduler config tuned for tests: no retry backoff, short heartbeats.
pub fn test_scheduler_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.retry.base_seconds = 0;
    config.retry.cap_seconds = 0;
    config.heartbeat_seconds = 1;
    config.task_timeout_seconds = 30;
    config
}

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

/// Handler that succeeds with a fixed value.
pub struct OkHandler(pub serde_json::Value);

#[async_trait]
impl TaskHandler for OkHandler {
    async fn handle(&self, _ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        Ok(self.0.clone())
    }
}

/// Handler that echoes its chain input, wrapped for inspection.
pub struct EchoInputHandler;

#[async_trait]
impl TaskHandler for EchoInputHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::json!({ "received": ctx.job.input }))
    }
}

/// Handler that fails `failures` times with a retryable error, then
/// succeeds.
pub struct FlakyHandler {
    remaining: AtomicU32,
}

impl FlakyHandler {
    pub fn failing(times: u32) -> Self {
        Self {
            remaining: AtomicU32::new(times),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, _ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::KvUnavailable("transient".into()));
        }
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Handler that always fails with a caller error; must never be retried.
pub struct InvalidInputHandler;

#[async_trait]
impl TaskHandler for InvalidInputHandler {
    async fn handle(&self, _ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        Err(CoreError::InvalidInput("bad request".into()))
    }
}

/// Handler that parks until its cancellation token fires.
pub struct BlockUntilCancelledHandler {
    pub started: Arc<Notify>,
    pub running: Arc<AtomicBool>,
}

impl BlockUntilCancelledHandler {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl TaskHandler for BlockUntilCancelledHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        self.running.store(true, Ordering::SeqCst);
        self.started.notify_waiters();
        ctx.cancel.cancelled().await;
        Err(CoreError::Cancelled("observed cancellation".into()))
    }
}

// ── Scripted container runtime ───────────────────────────────────────

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

/// Scripted in-memory container runtime; `hold` keeps containers running
/// until force-removed so cancellation paths can be observed.
pub struct ScriptedRuntime {
    state: Mutex<RuntimeState>,
    exited: Notify,
    pub script_stdout: Vec<u8>,
    pub exit_code: i64,
    pub hold: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new(script_stdout: impl Into<Vec<u8>>, exit_code: i64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState::default()),
            exited: Notify::new(),
            script_stdout: script_stdout.into(),
            exit_code,
            hold: AtomicBool::new(false),
        })
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
        container.stdout = self.script_stdout.clone();
        container.state = if self.hold.load(Ordering::SeqCst) {
            ContainerState::Running
        } else {
            ContainerState::Exited(self.exit_code)
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
