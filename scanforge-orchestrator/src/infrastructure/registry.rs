//! Job registry.
//!
//! Single source of truth for job lifecycle, backed by the KV store.
//! Every mutation goes through [`JobRegistry::transition`], which enforces
//! the state machine before writing. Per-job logs are stored as a paged
//! ring (64 KiB pages, 8 MiB cap) so replay never loads more than one
//! page at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use scanforge_core::domain::Finding;
use scanforge_core::{CoreError, KvError, KvStore, KvStoreExt};

use crate::domain::entities::{Job, JobId, JobKind, JobPayload};
use crate::domain::state::{JobState, JobTransitionError};

/// Log page size.
const LOG_PAGE_SIZE: u64 = 64 * 1024;
/// Per-job log ring capacity.
const LOG_RING_CAP: u64 = 8 * 1024 * 1024;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    IllegalTransition(#[from] JobTransitionError),
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => CoreError::NotFound(format!("job {id}")),
            RegistryError::IllegalTransition(e) => CoreError::Internal(e.to_string()),
            RegistryError::Kv(e) => CoreError::KvUnavailable(e.to_string()),
        }
    }
}

/// Fields a transition may update alongside the state change.
#[derive(Debug, Default)]
pub struct JobPatch {
    pub result: Option<serde_json::Value>,
    pub error: Option<CoreError>,
    pub container_name: Option<String>,
    pub worker_id: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
    /// Bump the 1-indexed attempt counter (set on retry re-queue).
    pub increment_attempt: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy)]
struct LogMeta {
    /// First retained byte offset (advances when the ring evicts pages).
    start: u64,
    /// One past the last written byte.
    end: u64,
}

/// KV-backed job registry.
pub struct JobRegistry {
    kv: Arc<dyn KvStore>,
    /// Optional TTL applied to job records; `None` keeps them until reaped.
    job_ttl: Option<Duration>,
}

impl JobRegistry {
    pub fn new(kv: Arc<dyn KvStore>, job_ttl: Option<Duration>) -> Self {
        Self { kv, job_ttl }
    }

    fn job_key(id: &str) -> String {
        format!("job:{id}")
    }

    fn log_meta_key(id: &str) -> String {
        format!("joblog:{id}:meta")
    }

    fn log_page_key(id: &str, page: u64) -> String {
        format!("joblog:{id}:{page}")
    }

    fn findings_key(id: &str) -> String {
        format!("jobfindings:{id}")
    }

    fn children_key(id: &str) -> String {
        format!("jobchildren:{id}")
    }

    fn container_key(name: &str) -> String {
        format!("container:{name}")
    }

    async fn save(&self, job: &Job) -> Result<(), RegistryError> {
        self.kv
            .set_json(&Self::job_key(&job.id), job, self.job_ttl)
            .await?;
        Ok(())
    }

    /// Create a job in `Queued` with `attempt = 1`.
    pub async fn create(
        &self,
        kind: JobKind,
        payload: JobPayload,
        parent_id: Option<JobId>,
    ) -> Result<Job, RegistryError> {
        let mut job = Job::new(kind, payload, parent_id.clone());
        job.max_attempts = kind.default_max_attempts();
        self.save(&job).await?;

        if let Some(parent) = parent_id {
            self.kv
                .lpush_json(&Self::children_key(&parent), &job.id)
                .await?;
        }

        debug!(job_id = %job.id, kind = %kind, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Job, RegistryError> {
        self.kv
            .get_json::<Job>(&Self::job_key(id))
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Resolve a scan container name to its owning job.
    pub async fn find_by_container(&self, container_name: &str) -> Result<Job, RegistryError> {
        let job_id: Option<JobId> = self
            .kv
            .get_json(&Self::container_key(container_name))
            .await?;
        match job_id {
            Some(id) => self.get(&id).await,
            None => Err(RegistryError::NotFound(container_name.to_string())),
        }
    }

    /// Apply a state transition with a patch. Illegal transitions fail
    /// without mutating anything.
    pub async fn transition(
        &self,
        id: &str,
        to: JobState,
        patch: JobPatch,
    ) -> Result<Job, RegistryError> {
        let mut job = self.get(id).await?;
        job.state.check_transition(to)?;

        let now = Utc::now();
        job.state = to;
        match to {
            JobState::Running => {
                job.started_at = Some(now);
                job.retry_at = None;
            }
            JobState::Success | JobState::Failure | JobState::Cancelled => {
                job.finished_at = Some(now);
                if job.started_at.is_none() {
                    // Cancelled straight out of the queue
                    job.started_at = Some(now);
                }
            }
            JobState::Queued | JobState::Retrying => {}
        }

        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        if let Some(error) = patch.error {
            job.error = Some(error);
        }
        if let Some(container_name) = patch.container_name {
            self.kv
                .set_json(&Self::container_key(&container_name), &job.id, self.job_ttl)
                .await?;
            job.container_name = Some(container_name);
        }
        if let Some(worker_id) = patch.worker_id {
            job.worker_id = Some(worker_id);
        }
        if patch.retry_at.is_some() {
            job.retry_at = patch.retry_at;
        }
        if patch.increment_attempt {
            job.attempt += 1;
        }

        self.save(&job).await?;
        debug!(job_id = %id, state = %to, "Job transitioned");
        Ok(job)
    }

    /// Record the container name on a freshly created scan job.
    pub async fn attach_container(
        &self,
        id: &str,
        container_name: &str,
    ) -> Result<Job, RegistryError> {
        let mut job = self.get(id).await?;
        job.container_name = Some(container_name.to_string());
        self.kv
            .set_json(&Self::container_key(container_name), &job.id, self.job_ttl)
            .await?;
        self.save(&job).await?;
        Ok(job)
    }

    /// Record a chain input on a queued job.
    pub async fn attach_input(
        &self,
        id: &str,
        input: serde_json::Value,
    ) -> Result<Job, RegistryError> {
        let mut job = self.get(id).await?;
        job.input = Some(input);
        self.save(&job).await?;
        Ok(job)
    }

    // ── Log ring ─────────────────────────────────────────────────────

    /// Append raw bytes to the job's log ring.
    pub async fn append_log(&self, id: &str, chunk: &[u8]) -> Result<(), RegistryError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let meta_key = Self::log_meta_key(id);
        let mut meta: LogMeta = self.kv.get_json(&meta_key).await?.unwrap_or_default();

        let mut written = 0usize;
        while written < chunk.len() {
            let page = meta.end / LOG_PAGE_SIZE;
            let offset_in_page = (meta.end % LOG_PAGE_SIZE) as usize;
            let room = LOG_PAGE_SIZE as usize - offset_in_page;
            let take = room.min(chunk.len() - written);

            let page_key = Self::log_page_key(id, page);
            let mut page_bytes = if offset_in_page > 0 {
                self.kv.get_raw(&page_key).await?.unwrap_or_default()
            } else {
                Vec::with_capacity(take)
            };
            page_bytes.truncate(offset_in_page);
            page_bytes.extend_from_slice(&chunk[written..written + take]);
            self.kv.set_raw(&page_key, page_bytes, self.job_ttl).await?;

            written += take;
            meta.end += take as u64;
        }

        // Evict whole pages that fell out of the ring
        if meta.end.saturating_sub(meta.start) > LOG_RING_CAP {
            let new_start_page = (meta.end - LOG_RING_CAP) / LOG_PAGE_SIZE;
            let old_start_page = meta.start / LOG_PAGE_SIZE;
            for page in old_start_page..new_start_page {
                self.kv.delete(&Self::log_page_key(id, page)).await?;
            }
            meta.start = new_start_page * LOG_PAGE_SIZE;
        }

        self.kv.set_json(&meta_key, &meta, self.job_ttl).await?;
        Ok(())
    }

    /// Read log bytes from `offset`; returns the bytes and the next
    /// offset to poll from. Offsets below the ring start are clamped.
    pub async fn read_log(&self, id: &str, offset: u64) -> Result<(Vec<u8>, u64), RegistryError> {
        let meta: LogMeta = self
            .kv
            .get_json(&Self::log_meta_key(id))
            .await?
            .unwrap_or_default();

        let from = offset.max(meta.start);
        if from >= meta.end {
            return Ok((Vec::new(), meta.end));
        }

        let mut collected = Vec::with_capacity((meta.end - from) as usize);
        let first_page = from / LOG_PAGE_SIZE;
        let last_page = (meta.end - 1) / LOG_PAGE_SIZE;
        for page in first_page..=last_page {
            let page_bytes = self
                .kv
                .get_raw(&Self::log_page_key(id, page))
                .await?
                .unwrap_or_default();
            let page_start = page * LOG_PAGE_SIZE;
            let skip = from.saturating_sub(page_start) as usize;
            if skip < page_bytes.len() {
                collected.extend_from_slice(&page_bytes[skip..]);
            }
        }

        Ok((collected, meta.end))
    }

    // ── Findings ─────────────────────────────────────────────────────

    pub async fn add_finding(&self, id: &str, finding: &Finding) -> Result<(), RegistryError> {
        self.kv
            .lpush_json(&Self::findings_key(id), finding)
            .await?;
        Ok(())
    }

    /// Findings for a job, in the order they were observed.
    pub async fn findings(&self, id: &str) -> Result<Vec<Finding>, RegistryError> {
        let mut findings: Vec<Finding> = self.kv.lrange_json(&Self::findings_key(id)).await?;
        findings.reverse();
        Ok(findings)
    }

    // ── Tree & reaping ───────────────────────────────────────────────

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<Job>, RegistryError> {
        let ids: Vec<JobId> = self.kv.lrange_json(&Self::children_key(parent_id)).await?;
        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(job) => children.push(job),
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(children)
    }

    /// All jobs currently in the registry.
    pub async fn list_all(&self) -> Result<Vec<Job>, RegistryError> {
        let keys = self.kv.keys("job:*").await?;
        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = self.kv.get_json::<Job>(&key).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Remove terminal jobs older than `before`, together with their
    /// logs and findings. Jobs with a living parent are skipped — the
    /// owning pipeline root is reaped first and takes its subtree with
    /// it.
    pub async fn reap(&self, before: DateTime<Utc>) -> Result<usize, RegistryError> {
        let jobs = self.list_all().await?;
        let mut reaped = 0usize;

        for job in &jobs {
            if !job.state.is_terminal() {
                continue;
            }
            let Some(finished_at) = job.finished_at else {
                continue;
            };
            if finished_at >= before {
                continue;
            }
            if let Some(parent) = &job.parent_id {
                if self.get(parent).await.is_ok() {
                    // Still referenced by an un-reaped parent
                    continue;
                }
            }

            self.delete_subtree(&job.id).await?;
            reaped += 1;
        }

        if reaped > 0 {
            info!(count = reaped, "Reaped terminal jobs");
        }
        Ok(reaped)
    }

    async fn delete_subtree(&self, id: &str) -> Result<(), RegistryError> {
        let children: Vec<JobId> = self.kv.lrange_json(&Self::children_key(id)).await?;
        for child in children {
            Box::pin(self.delete_subtree(&child)).await?;
        }
        self.delete_job(id).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), RegistryError> {
        let job = match self.get(id).await {
            Ok(job) => job,
            Err(RegistryError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let meta: LogMeta = self
            .kv
            .get_json(&Self::log_meta_key(id))
            .await?
            .unwrap_or_default();
        if meta.end > 0 {
            let first_page = meta.start / LOG_PAGE_SIZE;
            let last_page = (meta.end.saturating_sub(1)) / LOG_PAGE_SIZE;
            for page in first_page..=last_page {
                self.kv.delete(&Self::log_page_key(id, page)).await?;
            }
        }
        self.kv.delete(&Self::log_meta_key(id)).await?;
        self.kv.delete(&Self::findings_key(id)).await?;
        self.kv.delete(&Self::children_key(id)).await?;
        if let Some(container_name) = &job.container_name {
            self.kv.delete(&Self::container_key(container_name)).await?;
        }
        self.kv.delete(&Self::job_key(id)).await?;

        debug!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Mark `Running` jobs whose worker heartbeat expired as failed.
    /// Returns the affected job ids.
    pub async fn fail_orphaned_running_jobs(
        &self,
        live_workers: &std::collections::HashSet<String>,
    ) -> Result<Vec<JobId>, RegistryError> {
        let mut failed = Vec::new();
        for job in self.list_all().await? {
            if job.state != JobState::Running {
                continue;
            }
            let alive = job
                .worker_id
                .as_deref()
                .map(|w| live_workers.contains(w))
                .unwrap_or(false);
            if alive {
                continue;
            }
            warn!(job_id = %job.id, worker = ?job.worker_id, "Worker lost, failing job");
            self.transition(
                &job.id,
                JobState::Failure,
                JobPatch {
                    error: Some(CoreError::WorkerLost(format!(
                        "worker {} stopped heartbeating",
                        job.worker_id.as_deref().unwrap_or("unknown")
                    ))),
                    ..JobPatch::default()
                },
            )
            .await?;
            failed.push(job.id);
        }
        Ok(failed)
    }
}
