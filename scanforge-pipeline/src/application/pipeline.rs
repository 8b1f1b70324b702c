//! Pipeline runs, triggering, and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use scanforge_core::{CoreError, KvStore, KvStoreExt};
use scanforge_orchestrator::{JobId, JobKind, JobPayload, Scheduler, SubmitOptions};

/// What kicked a pipeline run off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

/// One execution of the CVE-to-validated-template workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub trigger_kind: TriggerKind,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cve_batch: Vec<String>,
    pub state: RunState,
}

impl PipelineRun {
    pub fn key(run_id: &str) -> String {
        format!("pipeline:run:{run_id}")
    }
}

/// Monotonic pipeline counters, kept in the KV store so they survive the
/// process and aggregate across workers.
#[derive(Clone)]
pub struct PipelineMetrics {
    kv: Arc<dyn KvStore>,
}

impl PipelineMetrics {
    pub const COUNTERS: [&'static str; 5] = [
        "templates_generated",
        "templates_validated",
        "validations_failed",
        "refinements_attempted",
        "refinements_exhausted",
    ];

    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn global_key(counter: &str) -> String {
        format!("metrics:pipeline:{counter}")
    }

    fn run_key(run_id: &str, counter: &str) -> String {
        format!("metrics:pipeline:{run_id}:{counter}")
    }

    /// Increment a counter globally and for the given run. Metric writes
    /// never fail a pipeline stage.
    pub async fn incr(&self, run_id: &str, counter: &str) {
        for key in [Self::global_key(counter), Self::run_key(run_id, counter)] {
            if let Err(e) = self.kv.incr(&key, 1).await {
                warn!(counter, error = %e, "Failed to bump pipeline counter");
            }
        }
    }

    /// Counter snapshot, global or for one run.
    pub async fn snapshot(
        &self,
        run_id: Option<&str>,
    ) -> Result<HashMap<String, i64>, CoreError> {
        let mut counters = HashMap::new();
        for counter in Self::COUNTERS {
            let key = match run_id {
                Some(run_id) => Self::run_key(run_id, counter),
                None => Self::global_key(counter),
            };
            let value = self
                .kv
                .get_counter(&key)
                .await
                .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
            counters.insert(counter.to_string(), value);
        }
        Ok(counters)
    }
}

/// Entry point for pipeline runs.
pub struct TemplatePipeline {
    scheduler: Arc<Scheduler>,
    kv: Arc<dyn KvStore>,
    metrics: PipelineMetrics,
}

impl TemplatePipeline {
    pub fn new(scheduler: Arc<Scheduler>, kv: Arc<dyn KvStore>) -> Self {
        let metrics = PipelineMetrics::new(kv.clone());
        Self {
            scheduler,
            kv,
            metrics,
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Trigger a pipeline run.
    ///
    /// Idempotent on `run_id`: re-triggering an existing run (terminal or
    /// in flight) returns the existing id without starting anything.
    pub async fn trigger(
        &self,
        trigger_kind: TriggerKind,
        run_id: Option<String>,
    ) -> Result<String, CoreError> {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let run = PipelineRun {
            run_id: run_id.clone(),
            trigger_kind,
            started_at: Utc::now(),
            root_job_id: None,
            cve_batch: Vec::new(),
            state: RunState::Running,
        };
        let inserted = self
            .kv
            .set_nx_json(&PipelineRun::key(&run_id), &run, None)
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
        if !inserted {
            info!(run_id = %run_id, "Pipeline run already exists, returning existing id");
            return Ok(run_id);
        }

        let root = self
            .scheduler
            .submit(
                JobKind::PipelineRoot,
                JobPayload::PipelineRoot {
                    run_id: run_id.clone(),
                },
                SubmitOptions::default(),
            )
            .await?;

        Self::update_run(&self.kv, &run_id, |run| {
            run.root_job_id = Some(root.id.clone());
        })
        .await?;

        info!(run_id = %run_id, root_job = %root.id, kind = ?trigger_kind, "Pipeline run triggered");
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, CoreError> {
        self.kv
            .get_json(&PipelineRun::key(run_id))
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))
    }

    /// Read-modify-write a run record. The root job is the only writer
    /// after creation, so this needs no CAS.
    pub async fn update_run(
        kv: &Arc<dyn KvStore>,
        run_id: &str,
        mutate: impl FnOnce(&mut PipelineRun),
    ) -> Result<(), CoreError> {
        let key = PipelineRun::key(run_id);
        let Some(mut run) = kv
            .get_json::<PipelineRun>(&key)
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?
        else {
            return Err(CoreError::NotFound(format!("pipeline run {run_id}")));
        };
        mutate(&mut run);
        kv.set_json(&key, &run, None)
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))
    }
}
