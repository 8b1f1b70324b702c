//! The `run_scan` task: launch, pump, wait, destroy.
//!
//! Drives one scanner container end to end: C1 launches it, the log pump
//! feeds C2, structured events land in C3's log and findings, and the
//! container is destroyed whichever way the run ends.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use scanforge_core::CoreError;
use scanforge_runner::{
    ContainerRunner, LaunchSpec, ScanEvent, ScanOutputParser, Target, TemplateSelector,
    TerminalHint,
};

use crate::application::scheduler::{TaskContext, TaskHandler};
use crate::domain::entities::{JobPayload, ScanOutcome, TerminalEvent};

/// Grace given to `wait` after the log stream has drained; the container
/// has normally exited by then.
const POST_DRAIN_WAIT: Duration = Duration::from_secs(10);

/// Handler for `scan` and `custom_scan` jobs.
pub struct ScanTaskHandler {
    runner: Arc<ContainerRunner>,
    /// Host template-library root, mounted into the container when the
    /// selector references library files.
    library_root: PathBuf,
    scan_timeout: Duration,
}

impl ScanTaskHandler {
    pub fn new(runner: Arc<ContainerRunner>, library_root: PathBuf, scan_timeout: Duration) -> Self {
        Self {
            runner,
            library_root,
            scan_timeout,
        }
    }

    /// Resolve payload into (target, selector, mount). Library-relative
    /// file selectors are rewritten to the in-container mount point.
    fn resolve(&self, payload: &JobPayload) -> Result<(Target, TemplateSelector, Option<PathBuf>), CoreError> {
        let (target, selector) = match payload {
            JobPayload::Scan { target, selector } => (target, selector.clone()),
            JobPayload::CustomScan {
                target,
                template_path,
            } => (
                target,
                TemplateSelector::File(PathBuf::from(template_path)),
            ),
            other => {
                return Err(CoreError::Internal(format!(
                    "scan handler received non-scan payload: {other:?}"
                )));
            }
        };

        let target = Target::parse(target).map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let (selector, mount) = match selector {
            TemplateSelector::File(relative) => (
                TemplateSelector::File(PathBuf::from("/templates").join(&relative)),
                Some(self.library_root.clone()),
            ),
            other => (other, None),
        };

        Ok((target, selector, mount))
    }
}

#[async_trait]
impl TaskHandler for ScanTaskHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let (target, selector, template_mount) = self.resolve(&ctx.job.payload)?;

        let handle = self
            .runner
            .launch(LaunchSpec {
                target,
                selector,
                container_name: ctx.job.container_name.clone(),
                template_mount,
            })
            .await
            .map_err(CoreError::from)?;

        info!(job_id = %ctx.job.id, container = %handle.container_name, "Scan container launched");

        let (mut chunks, pump_cancel) = self.runner.stream_logs(&handle);
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        let mut parser = ScanOutputParser::new();
        let mut abort: Option<CoreError> = None;

        'pump: loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        ctx.registry.append_log(&ctx.job.id, &chunk.bytes).await?;
                        for event in parser.push_chunk(&chunk.bytes) {
                            match event {
                                ScanEvent::Finding(finding) => {
                                    ctx.registry.add_finding(&ctx.job.id, &finding).await?;
                                }
                                ScanEvent::LoopDetected { window, distinct } => {
                                    abort = Some(CoreError::LoopDetected(format!(
                                        "{distinct} distinct lines in a window of {window}"
                                    )));
                                    break 'pump;
                                }
                                _ => {}
                            }
                        }
                    }
                    None => break 'pump,
                },
                _ = ctx.cancel.cancelled() => {
                    abort = Some(CoreError::Cancelled("scan cancelled".into()));
                    break 'pump;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    abort = Some(CoreError::Timeout(format!(
                        "scan exceeded {}s",
                        self.scan_timeout.as_secs()
                    )));
                    break 'pump;
                }
            }
        }
        pump_cancel.cancel();

        for event in parser.finish() {
            if let ScanEvent::Finding(finding) = event {
                ctx.registry.add_finding(&ctx.job.id, &finding).await?;
            }
        }

        if let Some(abort) = abort {
            // Partial findings stay in the registry; the container goes
            warn!(job_id = %ctx.job.id, container = %handle.container_name, error = %abort, "Scan aborted");
            self.runner.destroy(&handle.container_name).await;
            return Err(abort);
        }

        let exit_code = match self.runner.wait(&handle, POST_DRAIN_WAIT).await {
            Ok(code) => code,
            Err(e) => {
                self.runner.destroy(&handle.container_name).await;
                return Err(CoreError::from(e));
            }
        };

        self.runner.destroy(&handle.container_name).await;

        let terminal_event = match parser.terminal_hint() {
            Some(TerminalHint::NoResults) => TerminalEvent::NoResults,
            Some(TerminalHint::Completed) => TerminalEvent::Completed,
            None if exit_code == 0 => TerminalEvent::Completed,
            None => TerminalEvent::RuntimeError,
        };

        let outcome = ScanOutcome {
            exit_code,
            findings_count: parser.findings_count(),
            terminal_event,
        };
        info!(
            job_id = %ctx.job.id,
            exit_code,
            findings = outcome.findings_count,
            event = ?terminal_event,
            "Scan finished"
        );

        serde_json::to_value(&outcome).map_err(|e| CoreError::Internal(e.to_string()))
    }
}
