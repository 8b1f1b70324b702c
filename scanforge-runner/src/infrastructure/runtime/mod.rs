//! Container runtime port.
//!
//! Everything the runner needs from the container runtime, behind an
//! object-safe trait so tests can script it. The production adapter
//! drives the `docker` CLI.

mod docker_cli;

pub use docker_cli::DockerCliRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scanforge_core::config::ResourceLimits;

use crate::domain::selector::TemplateSelector;

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime daemon is unreachable.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("image missing: {0}")]
    ImageMissing(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container name already in use: {0}")]
    AlreadyExists(String),
    #[error("runtime command failed: {0}")]
    CommandFailed(String),
    #[error("runtime io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run: image, name, argv, network and resource limits.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub network_mode: String,
    pub limits: ResourceLimits,
    /// Host directory mounted read-only at the scanner's template root.
    pub template_mount: Option<(std::path::PathBuf, String)>,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i64),
    Missing,
}

/// Captured log bytes, full stream per source since container start.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Opaque reference to a live scan container. Owned exclusively by the
/// job that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub container_name: String,
    pub runtime_id: String,
    pub target: String,
    pub template_selector: TemplateSelector,
    pub started_at: DateTime<Utc>,
}

/// Port onto the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime daemon answers.
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a stopped container; returns the runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Full log capture since container start. Callers resume by
    /// suppressing bytes below their high-water mark.
    async fn logs(&self, name: &str) -> Result<LogCapture, RuntimeError>;

    /// Block until the container exits; returns the exit code.
    async fn wait(&self, name: &str) -> Result<i64, RuntimeError>;

    /// Remove a container. With `force`, a running container is killed
    /// first.
    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    async fn state(&self, name: &str) -> Result<ContainerState, RuntimeError>;
}
