//! Docker CLI runtime adapter.
//!
//! Drives the `docker` binary with `tokio::process`. Error classification
//! is based on the CLI's stderr text, which has been stable across
//! engine versions for the messages matched here.

use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ContainerRuntime, ContainerSpec, ContainerState, LogCapture, RuntimeError};

/// Container runtime backed by the `docker` command-line client.
pub struct DockerCliRuntime {
    binary: String,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!(binary = %self.binary, ?args, "Running container runtime command");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{} binary not found", self.binary))
                } else {
                    RuntimeError::Io(e)
                }
            })?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(?args, stderr = %stderr, "Container runtime command failed");
        Err(Self::classify(&stderr))
    }

    fn classify(stderr: &str) -> RuntimeError {
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("cannot connect to the docker daemon")
            || lowered.contains("connection refused")
        {
            RuntimeError::Unavailable(stderr.to_string())
        } else if lowered.contains("no such container") {
            RuntimeError::NotFound(stderr.to_string())
        } else if lowered.contains("already in use") {
            RuntimeError::AlreadyExists(stderr.to_string())
        } else if lowered.contains("no such image")
            || lowered.contains("manifest unknown")
            || lowered.contains("pull access denied")
        {
            RuntimeError::ImageMissing(stderr.to_string())
        } else {
            RuntimeError::CommandFailed(stderr.to_string())
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.run_checked(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
            .map_err(|e| match e {
                RuntimeError::CommandFailed(msg) => RuntimeError::Unavailable(msg),
                other => other,
            })
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let output = self.run(&["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run_checked(&["pull", image]).await.map(|_| ())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let cpus = format!("{}", spec.limits.cpus);
        let memory = format!("{}m", spec.limits.memory_mb);
        let pids = format!("{}", spec.limits.pids);
        let network = format!("--network={}", spec.network_mode);

        let mut args: Vec<&str> = vec![
            "create",
            "--name",
            &spec.name,
            &network,
            "--cpus",
            &cpus,
            "--memory",
            &memory,
            "--pids-limit",
            &pids,
        ];

        let mount;
        if let Some((host_dir, container_dir)) = &spec.template_mount {
            mount = format!("{}:{}:ro", host_dir.display(), container_dir);
            args.push("-v");
            args.push(&mount);
        }

        args.push(&spec.image);
        for arg in &spec.command {
            args.push(arg);
        }

        let output = self.run_checked(&args).await?;
        let runtime_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if runtime_id.is_empty() {
            return Err(RuntimeError::CommandFailed(
                "create returned no container id".to_string(),
            ));
        }
        Ok(runtime_id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_checked(&["start", name]).await.map(|_| ())
    }

    async fn logs(&self, name: &str) -> Result<LogCapture, RuntimeError> {
        // `docker logs` demultiplexes: container stdout on our stdout,
        // container stderr on our stderr
        let output = self.run(&["logs", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Self::classify(&stderr));
        }
        Ok(LogCapture {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let output = self.run_checked(&["wait", name]).await?;
        let code_text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        code_text
            .parse()
            .map_err(|_| RuntimeError::CommandFailed(format!("unparseable exit code {code_text:?}")))
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let args: &[&str] = if force {
            &["rm", "-f", name]
        } else {
            &["rm", name]
        };
        self.run_checked(args).await.map(|_| ())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                name,
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return match Self::classify(&stderr) {
                RuntimeError::NotFound(_) | RuntimeError::CommandFailed(_) => {
                    Ok(ContainerState::Missing)
                }
                other => Err(other),
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let mut parts = stdout.split_whitespace();
        let status = parts.next().unwrap_or_default();
        let exit_code: i64 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);

        Ok(match status {
            "created" => ContainerState::Created,
            "running" | "restarting" | "paused" => ContainerState::Running,
            "exited" | "dead" => ContainerState::Exited(exit_code),
            _ => ContainerState::Missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_daemon_down_as_unavailable() {
        let err = DockerCliRuntime::classify(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        assert!(matches!(err, RuntimeError::Unavailable(_)));
    }

    #[test]
    fn classifies_missing_container() {
        let err = DockerCliRuntime::classify("Error response from daemon: No such container: x");
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[test]
    fn classifies_name_conflicts() {
        let err = DockerCliRuntime::classify(
            "Error response from daemon: Conflict. The container name \"/nuclei_scan_a\" is already in use",
        );
        assert!(matches!(err, RuntimeError::AlreadyExists(_)));
    }

    #[test]
    fn classifies_missing_image() {
        let err = DockerCliRuntime::classify("Error response from daemon: No such image: nuclei:x");
        assert!(matches!(err, RuntimeError::ImageMissing(_)));
    }
}
