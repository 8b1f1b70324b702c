//! Container runner.
//!
//! Encapsulates every interaction with the container runtime for a single
//! scanner invocation: launch with rollback, resumable log streaming,
//! bounded wait, idempotent destroy, and a background reaper that makes
//! sure no scan container outlives its job.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scanforge_core::CoreError;
use scanforge_core::config::RunnerConfig;

use crate::domain::events::{LogChunk, LogSource};
use crate::domain::selector::TemplateSelector;
use crate::domain::target::Target;
use crate::infrastructure::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError,
};

/// Capacity of the log pump channel; when full, the pump stops polling
/// the runtime until the consumer drains.
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Attempts at allocating a collision-free container name.
const NAME_ALLOCATION_ATTEMPTS: usize = 5;

/// Runner errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("scanner image missing: {0}")]
    ImageMissing(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<RunnerError> for CoreError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::InvalidTarget(msg) => CoreError::InvalidInput(msg),
            RunnerError::RuntimeUnavailable(msg) => CoreError::RuntimeUnavailable(msg),
            RunnerError::ImageMissing(msg) => CoreError::RuntimeUnavailable(msg),
            RunnerError::ResourceExhausted(msg) => CoreError::RuntimeUnavailable(msg),
            RunnerError::Timeout(msg) => CoreError::Timeout(msg),
            RunnerError::Runtime(RuntimeError::Unavailable(msg)) => {
                CoreError::RuntimeUnavailable(msg)
            }
            RunnerError::Runtime(other) => CoreError::Internal(other.to_string()),
        }
    }
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub target: Target,
    pub selector: TemplateSelector,
    /// Pre-allocated container name; `None` lets the runner allocate one.
    pub container_name: Option<String>,
    /// Host directory mounted read-only at the scanner's template root,
    /// required for `Dirs`/`File` selectors that reference the library.
    pub template_mount: Option<PathBuf>,
}

struct LiveContainer {
    handle: ContainerHandle,
    /// Set once the owning job reached a terminal state; the reaper
    /// removes the container `destroy_grace` after this.
    terminal_at: Option<Instant>,
    launched_at: Instant,
}

/// Launches, observes, log-streams, and tears down scanner containers.
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: RunnerConfig,
    live: Mutex<HashMap<String, LiveContainer>>,
}

impl ContainerRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RunnerConfig) -> Self {
        Self {
            runtime,
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh scan container name.
    pub fn allocate_name() -> String {
        format!("nuclei_scan_{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff)
    }

    /// Validate, create, and start a scanner container.
    ///
    /// A start failure removes the created container before returning, so
    /// a failed launch never leaks.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, RunnerError> {
        self.runtime.ping().await.map_err(|e| match e {
            RuntimeError::Unavailable(msg) => RunnerError::RuntimeUnavailable(msg),
            other => RunnerError::Runtime(other),
        })?;

        self.ensure_image().await?;

        let name = self.allocate_free_name(spec.container_name.clone()).await?;

        let mut command = vec!["-u".to_string(), spec.target.as_str().to_string()];
        command.extend(spec.selector.to_args());

        let container_spec = ContainerSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            command,
            network_mode: self.config.network_mode.clone(),
            limits: self.config.resource_limits.clone(),
            template_mount: spec.template_mount.map(|dir| (dir, "/templates".to_string())),
        };

        let runtime_id = self.runtime.create(&container_spec).await.map_err(|e| match e {
            RuntimeError::AlreadyExists(msg) => RunnerError::ResourceExhausted(msg),
            RuntimeError::ImageMissing(msg) => RunnerError::ImageMissing(msg),
            RuntimeError::Unavailable(msg) => RunnerError::RuntimeUnavailable(msg),
            other => RunnerError::Runtime(other),
        })?;

        if let Err(start_err) = self.runtime.start(&name).await {
            // Never leave a created-but-unstarted container behind
            if let Err(rm_err) = self.runtime.remove(&name, true).await {
                warn!(container = %name, error = %rm_err, "Failed to roll back container after start failure");
            }
            return Err(match start_err {
                RuntimeError::Unavailable(msg) => RunnerError::RuntimeUnavailable(msg),
                other => RunnerError::Runtime(other),
            });
        }

        let handle = ContainerHandle {
            container_name: name.clone(),
            runtime_id,
            target: spec.target.as_str().to_string(),
            template_selector: spec.selector,
            started_at: Utc::now(),
        };

        self.live.lock().await.insert(
            name.clone(),
            LiveContainer {
                handle: handle.clone(),
                terminal_at: None,
                launched_at: Instant::now(),
            },
        );

        info!(container = %name, target = %handle.target, "Scan container started");
        Ok(handle)
    }

    async fn ensure_image(&self) -> Result<(), RunnerError> {
        let present = self
            .runtime
            .image_present(&self.config.image)
            .await
            .map_err(|e| match e {
                RuntimeError::Unavailable(msg) => RunnerError::RuntimeUnavailable(msg),
                other => RunnerError::Runtime(other),
            })?;
        if present {
            return Ok(());
        }
        if !self.config.pull_on_missing {
            return Err(RunnerError::ImageMissing(self.config.image.clone()));
        }
        info!(image = %self.config.image, "Scanner image missing locally, pulling");
        self.runtime.pull_image(&self.config.image).await.map_err(|e| match e {
            RuntimeError::ImageMissing(msg) => RunnerError::ImageMissing(msg),
            RuntimeError::Unavailable(msg) => RunnerError::RuntimeUnavailable(msg),
            other => RunnerError::Runtime(other),
        })
    }

    /// Confirm non-collision with the runtime before using a name.
    async fn allocate_free_name(&self, requested: Option<String>) -> Result<String, RunnerError> {
        if let Some(name) = requested {
            return match self.runtime.state(&name).await? {
                ContainerState::Missing => Ok(name),
                _ => Err(RunnerError::ResourceExhausted(format!(
                    "container name {name} already in use"
                ))),
            };
        }
        for _ in 0..NAME_ALLOCATION_ATTEMPTS {
            let name = Self::allocate_name();
            if self.runtime.state(&name).await? == ContainerState::Missing {
                return Ok(name);
            }
        }
        Err(RunnerError::ResourceExhausted(
            "could not allocate a free container name".to_string(),
        ))
    }

    /// Stream the container's combined output as tagged, offset-ordered
    /// chunks.
    ///
    /// The pump refetches the full log from the runtime and suppresses
    /// bytes already delivered via per-source high-water marks, so the
    /// stream is resumable and never delivers a chunk out of order. The
    /// channel is bounded; a slow consumer backpressures the pump.
    pub fn stream_logs(
        self: &Arc<Self>,
        handle: &ContainerHandle,
    ) -> (mpsc::Receiver<LogChunk>, CancellationToken) {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let runner = self.clone();
        let name = handle.container_name.clone();
        let pump_cancel = cancel.clone();
        let poll_interval = Duration::from_millis(self.config.log_poll_millis.max(50));

        tokio::spawn(async move {
            let mut stdout_hwm: u64 = 0;
            let mut stderr_hwm: u64 = 0;
            let mut container_done = false;

            loop {
                if pump_cancel.is_cancelled() {
                    break;
                }

                match runner.runtime.logs(&name).await {
                    Ok(capture) => {
                        for (source, bytes, hwm) in [
                            (LogSource::Stdout, &capture.stdout, &mut stdout_hwm),
                            (LogSource::Stderr, &capture.stderr, &mut stderr_hwm),
                        ] {
                            if (bytes.len() as u64) <= *hwm {
                                continue;
                            }
                            let chunk = LogChunk {
                                source,
                                offset: *hwm,
                                bytes: bytes[*hwm as usize..].to_vec(),
                            };
                            *hwm = bytes.len() as u64;
                            tokio::select! {
                                sent = tx.send(chunk) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                                _ = pump_cancel.cancelled() => return,
                            }
                        }
                    }
                    Err(RuntimeError::NotFound(_)) => break,
                    Err(e) => {
                        debug!(container = %name, error = %e, "Log fetch failed, retrying");
                    }
                }

                if container_done {
                    // One post-exit fetch already delivered the tail
                    break;
                }
                match runner.runtime.state(&name).await {
                    Ok(ContainerState::Running) | Ok(ContainerState::Created) => {}
                    _ => container_done = true,
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = pump_cancel.cancelled() => break,
                }
            }
        });

        (rx, cancel)
    }

    /// Wait for the container to exit, bounded by a deadline.
    pub async fn wait(
        &self,
        handle: &ContainerHandle,
        deadline: Duration,
    ) -> Result<i64, RunnerError> {
        let result = tokio::time::timeout(deadline, self.runtime.wait(&handle.container_name)).await;
        match result {
            Ok(Ok(exit_code)) => {
                self.mark_terminal(&handle.container_name).await;
                Ok(exit_code)
            }
            Ok(Err(e)) => Err(RunnerError::Runtime(e)),
            Err(_) => Err(RunnerError::Timeout(format!(
                "container {} did not exit within {}s",
                handle.container_name,
                deadline.as_secs()
            ))),
        }
    }

    /// Observed runtime state for a container name.
    pub async fn container_state(&self, name: &str) -> Result<ContainerState, RunnerError> {
        Ok(self.runtime.state(name).await?)
    }

    /// Destroy a container. Idempotent; always safe to call.
    pub async fn destroy(&self, name: &str) {
        match self.runtime.remove(name, true).await {
            Ok(()) => info!(container = %name, "Scan container removed"),
            Err(RuntimeError::NotFound(_)) => {
                debug!(container = %name, "Scan container already gone")
            }
            Err(e) => warn!(container = %name, error = %e, "Failed to remove scan container"),
        }
        self.live.lock().await.remove(name);
    }

    /// Record that the owning job reached a terminal state; the reaper
    /// removes the container after the configured grace.
    pub async fn mark_terminal(&self, name: &str) {
        if let Some(live) = self.live.lock().await.get_mut(name) {
            live.terminal_at.get_or_insert_with(Instant::now);
        }
    }

    /// One reaper sweep: remove containers whose job finished more than
    /// `destroy_grace` ago, and abandoned containers past the scan
    /// timeout plus grace.
    pub async fn reap(&self) {
        let grace = Duration::from_secs(self.config.destroy_grace_seconds);
        let abandon_after = Duration::from_secs(self.config.scan_timeout_seconds) + grace;

        let due: Vec<String> = {
            let live = self.live.lock().await;
            live.values()
                .filter(|c| {
                    c.terminal_at.is_some_and(|at| at.elapsed() >= grace)
                        || c.launched_at.elapsed() >= abandon_after
                })
                .map(|c| c.handle.container_name.clone())
                .collect()
        };

        for name in due {
            warn!(container = %name, "Reaping leftover scan container");
            self.destroy(&name).await;
        }
    }

    /// Destroy every live container; called on shutdown.
    pub async fn reap_all(&self) {
        let names: Vec<String> = self.live.lock().await.keys().cloned().collect();
        for name in names {
            self.destroy(&name).await;
        }
    }

    /// Spawn the periodic reaper. Sweeps until the token is cancelled,
    /// then destroys everything still live.
    pub fn spawn_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.reap_interval_seconds.max(1));
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Container reaper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.reap().await,
                    _ = shutdown.cancelled() => {
                        info!("Container reaper shutting down, destroying live containers");
                        self.reap_all().await;
                        break;
                    }
                }
            }
        });
    }

    /// Number of containers currently tracked as live.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }
}
