//! Shared test doubles for runner integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};

use scanforge_runner::{
    ContainerRuntime, ContainerSpec, ContainerState, LogCapture, RuntimeError,
};

pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub state: ContainerState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    removed: Vec<String>,
}

/// Scripted in-memory container runtime.
///
/// `start` makes the scripted log and exit code visible; with `hold` set,
/// the container stays running until it is force-removed, which lets
/// cancellation tests observe a live container.
pub struct ScriptedRuntime {
    state: Mutex<State>,
    exited: Notify,
    pub script_stdout: Vec<u8>,
    pub script_stderr: Vec<u8>,
    pub exit_code: i64,
    pub image_present: AtomicBool,
    pub daemon_down: AtomicBool,
    pub fail_start: AtomicBool,
    pub hold: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new(script_stdout: impl Into<Vec<u8>>, exit_code: i64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            exited: Notify::new(),
            script_stdout: script_stdout.into(),
            script_stderr: Vec::new(),
            exit_code,
            image_present: AtomicBool::new(true),
            daemon_down: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            hold: AtomicBool::new(false),
        })
    }

    pub async fn container_names(&self) -> Vec<String> {
        self.state.lock().await.containers.keys().cloned().collect()
    }

    pub async fn removed_names(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }

    fn check_daemon(&self) -> Result<(), RuntimeError> {
        if self.daemon_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_daemon()
    }

    async fn image_present(&self, _image: &str) -> Result<bool, RuntimeError> {
        self.check_daemon()?;
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_daemon()?;
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
                stderr: Vec::new(),
            },
        );
        Ok(format!("fake-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_daemon()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed("scripted start failure".into()));
        }
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.stdout = self.script_stdout.clone();
        container.stderr = self.script_stderr.clone();
        container.state = if self.hold.load(Ordering::SeqCst) {
            ContainerState::Running
        } else {
            ContainerState::Exited(self.exit_code)
        };
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<LogCapture, RuntimeError> {
        self.check_daemon()?;
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(LogCapture {
            stdout: container.stdout.clone(),
            stderr: container.stderr.clone(),
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

    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        if matches!(container.state, ContainerState::Running) && !force {
            return Err(RuntimeError::CommandFailed("container is running".into()));
        }
        state.containers.remove(name);
        state.removed.push(name.to_string());
        drop(state);
        self.exited.notify_waiters();
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        self.check_daemon()?;
        let state = self.state.lock().await;
        Ok(state
            .containers
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }
}
