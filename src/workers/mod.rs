//! Background workers for the scanforge service
//!
//! Periodic maintenance tasks: scheduled pipeline runs and registry
//! reaping. The container reaper lives with the runner.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scanforge_core::Config;
use scanforge_orchestrator::JobRegistry;
use scanforge_pipeline::{TemplatePipeline, TriggerKind};

/// Spawn a worker that triggers the synthesis pipeline on a schedule.
/// Disabled when the configured interval is zero.
pub fn spawn_pipeline_schedule_worker(
    pipeline: Arc<TemplatePipeline>,
    config: &Config,
    shutdown: CancellationToken,
) {
    let interval_hours = config.pipeline.schedule_interval_hours;
    if interval_hours == 0 {
        info!("Pipeline schedule disabled");
        return;
    }

    tokio::spawn(async move {
        info!(interval_hours, "Pipeline schedule worker started");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_hours * 3600));
        // The immediate first tick would race service startup
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("Triggering scheduled pipeline run");
                    match pipeline.trigger(TriggerKind::Scheduled, None).await {
                        Ok(run_id) => info!(run_id = %run_id, "Scheduled pipeline run triggered"),
                        Err(e) => error!(error = %e, "Scheduled pipeline trigger failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Pipeline schedule worker shutting down");
                    break;
                }
            }
        }
    });
}

/// Spawn a worker that reaps terminal jobs older than the configured
/// retention. Disabled when `kv.job_ttl_hours` is zero (the KV TTL
/// already bounds growth in that mode).
pub fn spawn_job_reaper_worker(
    registry: Arc<JobRegistry>,
    config: &Config,
    shutdown: CancellationToken,
) {
    let retention_hours = config.kv.job_ttl_hours;
    if retention_hours == 0 {
        return;
    }

    tokio::spawn(async move {
        info!(retention_hours, "Job reaper worker started");
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::hours(retention_hours as i64);
                    match registry.reap(cutoff).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Reaped terminal jobs"),
                        Err(e) => error!(error = %e, "Job reaping failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Job reaper worker shutting down");
                    break;
                }
            }
        }
    });
}
