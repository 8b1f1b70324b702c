//! Task scheduler.
//!
//! Accepts work, dispatches it to per-queue worker pools with bounded
//! concurrency, applies the retry policy, and owns cooperative
//! cancellation. Handlers are looked up by job kind; the scheduler never
//! knows what a task does.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scanforge_core::config::SchedulerConfig;
use scanforge_core::{CoreError, KvStore, KvStoreExt, RetryPolicy};

use crate::domain::entities::{Job, JobId, JobKind, JobPayload};
use crate::domain::state::JobState;
use crate::infrastructure::queue::{QueueName, TaskQueue};
use crate::infrastructure::registry::{JobPatch, JobRegistry};

/// Poll fallback for terminal-state waiters; the completion notify is the
/// primary wake-up.
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a worker blocks on its queue before re-checking shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a task handler gets to work with.
pub struct TaskContext {
    pub job: Job,
    pub registry: Arc<JobRegistry>,
    pub cancel: CancellationToken,
}

/// A registered task implementation, looked up by [`JobKind`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError>;
}

/// Options for [`Scheduler::submit`].
#[derive(Default)]
pub struct SubmitOptions {
    pub parent_id: Option<JobId>,
    /// Chain input: result of the preceding stage.
    pub input: Option<serde_json::Value>,
    /// Pre-allocated container name for scan-kind jobs.
    pub container_name: Option<String>,
}

/// The task scheduler. One instance per process, injected into its users.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    kv: Arc<dyn KvStore>,
    queues: HashMap<QueueName, TaskQueue>,
    handlers: RwLock<HashMap<JobKind, Arc<dyn TaskHandler>>>,
    config: SchedulerConfig,
    retry_policy: RetryPolicy,
    worker_id: String,
    shutdown: CancellationToken,
    cancels: Mutex<HashMap<JobId, CancellationToken>>,
    completions: Mutex<HashMap<JobId, Arc<Notify>>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        kv: Arc<dyn KvStore>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| {
                (
                    name,
                    TaskQueue::new(kv.clone(), name, config.queue_soft_cap),
                )
            })
            .collect();

        Self {
            registry,
            kv,
            queues,
            handlers: RwLock::new(HashMap::new()),
            retry_policy: config.retry.to_retry_policy(),
            config,
            worker_id: format!("worker:{}", Uuid::new_v4().simple()),
            shutdown,
            cancels: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register the handler for a job kind. Later registrations replace
    /// earlier ones, which tests use to substitute fakes.
    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(kind, handler);
    }

    fn handler_for(&self, kind: JobKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(&kind)
            .cloned()
    }

    fn concurrency_for(&self, queue: QueueName) -> usize {
        let configured = match queue {
            QueueName::Scans => self.config.scans_concurrency,
            QueueName::Pipeline => self.config.pipeline_concurrency,
            QueueName::Generate => self.config.generate_concurrency,
            QueueName::Validate => self.config.validate_concurrency,
            QueueName::Refine => self.config.refine_concurrency,
        };
        configured.max(1)
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Create a job and place it on its kind's queue.
    ///
    /// Scan-kind jobs get their container name allocated here, before
    /// enqueueing, so submission can return it synchronously.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload: JobPayload,
        opts: SubmitOptions,
    ) -> Result<Job, CoreError> {
        let queue = self
            .queues
            .get(&QueueName::for_kind(kind))
            .expect("queue map covers every kind");

        let mut job = self.registry.create(kind, payload, opts.parent_id).await?;

        if let Some(input) = opts.input {
            job = self.registry.attach_input(&job.id, input).await?;
        }
        if kind.is_scan() {
            let container_name = opts
                .container_name
                .unwrap_or_else(scanforge_runner::ContainerRunner::allocate_name);
            job = self.registry.attach_container(&job.id, &container_name).await?;
        }

        if let Err(e) = queue.enqueue(&job.id).await {
            // Shed load: the job must not linger in `queued` forever
            let _ = self
                .registry
                .transition(
                    &job.id,
                    JobState::Cancelled,
                    JobPatch {
                        error: Some(e.clone()),
                        ..JobPatch::default()
                    },
                )
                .await;
            return Err(e);
        }

        debug!(job_id = %job.id, kind = %kind, queue = %queue.name(), "Job submitted");
        Ok(job)
    }

    // ── Workers ──────────────────────────────────────────────────────

    /// Spawn the per-queue worker pools and the heartbeat task.
    pub fn spawn_workers(self: &Arc<Self>) {
        for queue_name in QueueName::ALL {
            let scheduler = self.clone();
            let concurrency = self.concurrency_for(queue_name);
            tokio::spawn(async move {
                scheduler.worker_pool(queue_name, concurrency).await;
            });
        }
        self.spawn_heartbeat();
        info!(worker_id = %self.worker_id, "Scheduler workers started");
    }

    async fn worker_pool(self: Arc<Self>, queue_name: QueueName, concurrency: usize) {
        let queue = self.queues.get(&queue_name).expect("known queue").clone();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(queue = %queue_name, concurrency, "Worker pool started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!(error = %err, "Failed to acquire concurrency permit");
                    break;
                }
            };

            let task = tokio::select! {
                task = queue.dequeue(DEQUEUE_TIMEOUT) => task,
                _ = self.shutdown.cancelled() => break,
            };

            match task {
                Ok(Some(task)) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.process_task(&task.job_id).await;
                        drop(permit);
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    error!(queue = %queue_name, error = %e, "Failed to poll queue");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        warn!(queue = %queue_name, "Worker pool exiting");
    }

    async fn process_task(self: &Arc<Self>, job_id: &str) {
        let job = match self.registry.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "Dequeued job no longer in registry");
                return;
            }
        };

        // Cancelled (or otherwise moved on) while sitting in the queue
        if job.state != JobState::Queued {
            debug!(job_id, state = %job.state, "Skipping non-queued job");
            self.notify_completion(job_id).await;
            return;
        }

        let job = match self
            .registry
            .transition(
                job_id,
                JobState::Running,
                JobPatch {
                    worker_id: Some(self.worker_id.clone()),
                    ..JobPatch::default()
                },
            )
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to transition job to running");
                return;
            }
        };

        let Some(handler) = self.handler_for(job.kind) else {
            error!(job_id, kind = %job.kind, "No handler registered for job kind");
            let _ = self
                .registry
                .transition(
                    job_id,
                    JobState::Failure,
                    JobPatch {
                        error: Some(CoreError::Internal(format!(
                            "no handler registered for kind {}",
                            job.kind
                        ))),
                        ..JobPatch::default()
                    },
                )
                .await;
            self.notify_completion(job_id).await;
            return;
        };

        let cancel = self.shutdown.child_token();
        self.cancels
            .lock()
            .await
            .insert(job_id.to_string(), cancel.clone());

        let attempt = job.attempt;
        let max_attempts = job.max_attempts;
        let kind = job.kind;
        let deadline = Duration::from_secs(self.config.task_timeout_seconds);
        let ctx = TaskContext {
            job,
            registry: self.registry.clone(),
            cancel: cancel.clone(),
        };

        info!(job_id, kind = %kind, attempt, "Task started");
        let outcome = tokio::select! {
            result = tokio::time::timeout(deadline, handler.handle(ctx)) => match result {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(format!(
                    "task exceeded {}s deadline",
                    deadline.as_secs()
                ))),
            },
            _ = cancel.cancelled() => Err(CoreError::Cancelled("cancellation requested".into())),
        };

        self.cancels.lock().await.remove(job_id);

        match outcome {
            Ok(result) => {
                info!(job_id, kind = %kind, "Task succeeded");
                let _ = self
                    .registry
                    .transition(
                        job_id,
                        JobState::Success,
                        JobPatch {
                            result: Some(result),
                            ..JobPatch::default()
                        },
                    )
                    .await;
            }
            Err(CoreError::Cancelled(reason)) => {
                info!(job_id, kind = %kind, reason = %reason, "Task cancelled");
                let _ = self
                    .registry
                    .transition(
                        job_id,
                        JobState::Cancelled,
                        JobPatch {
                            error: Some(CoreError::Cancelled(reason)),
                            ..JobPatch::default()
                        },
                    )
                    .await;
            }
            Err(e) if e.retryable() && attempt < max_attempts => {
                let delay = self.retry_policy.backoff(attempt);
                warn!(
                    job_id, kind = %kind, attempt, error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Task failed, scheduling retry"
                );
                let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                let transitioned = self
                    .registry
                    .transition(
                        job_id,
                        JobState::Retrying,
                        JobPatch {
                            error: Some(e),
                            retry_at: Some(retry_at),
                            ..JobPatch::default()
                        },
                    )
                    .await;
                if transitioned.is_ok() {
                    self.schedule_requeue(job_id.to_string(), delay);
                }
            }
            Err(e) => {
                warn!(job_id, kind = %kind, error = %e, "Task failed terminally");
                let _ = self
                    .registry
                    .transition(
                        job_id,
                        JobState::Failure,
                        JobPatch {
                            error: Some(e),
                            ..JobPatch::default()
                        },
                    )
                    .await;
            }
        }

        self.notify_completion(job_id).await;
    }

    /// Requeue a retrying job after its backoff delay.
    fn schedule_requeue(self: &Arc<Self>, job_id: JobId, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scheduler.shutdown.cancelled() => return,
            }

            let job = match scheduler
                .registry
                .transition(
                    &job_id,
                    JobState::Queued,
                    JobPatch {
                        increment_attempt: true,
                        ..JobPatch::default()
                    },
                )
                .await
            {
                Ok(job) => job,
                // Cancelled while backing off; nothing to requeue
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, "Retry requeue skipped");
                    return;
                }
            };

            let queue = scheduler
                .queues
                .get(&QueueName::for_kind(job.kind))
                .expect("queue map covers every kind");
            if let Err(e) = queue.enqueue(&job_id).await {
                error!(job_id = %job_id, error = %e, "Failed to requeue retrying job");
                let _ = scheduler
                    .registry
                    .transition(
                        &job_id,
                        JobState::Cancelled,
                        JobPatch {
                            error: Some(e),
                            ..JobPatch::default()
                        },
                    )
                    .await;
                scheduler.notify_completion(&job_id).await;
            }
        });
    }

    // ── Heartbeats & recovery ────────────────────────────────────────

    fn heartbeat_key(worker_id: &str) -> String {
        format!("worker:heartbeat:{worker_id}")
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let scheduler = self.clone();
        let interval = Duration::from_secs(self.config.heartbeat_seconds.max(1));
        tokio::spawn(async move {
            let key = Self::heartbeat_key(&scheduler.worker_id);
            let ttl = interval * 3;
            loop {
                if let Err(e) = scheduler
                    .kv
                    .set_json(&key, &Utc::now(), Some(ttl))
                    .await
                {
                    warn!(error = %e, "Failed to write worker heartbeat");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = scheduler.shutdown.cancelled() => {
                        let _ = scheduler.kv.delete(&key).await;
                        break;
                    }
                }
            }
        });
    }

    /// Startup recovery: fail jobs orphaned by dead workers and resume
    /// backoff timers for retrying jobs.
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<JobId>, CoreError> {
        // Mark ourselves alive before judging everyone else
        self.kv
            .set_json(
                &Self::heartbeat_key(&self.worker_id),
                &Utc::now(),
                Some(Duration::from_secs(self.config.heartbeat_seconds * 3)),
            )
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;

        let live: HashSet<String> = self
            .kv
            .keys("worker:heartbeat:*")
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?
            .into_iter()
            .filter_map(|key| key.strip_prefix("worker:heartbeat:").map(str::to_string))
            .collect();

        let failed = self.registry.fail_orphaned_running_jobs(&live).await?;
        for job_id in &failed {
            self.notify_completion(job_id).await;
        }

        // Resume backoff timers that died with the previous process
        for job in self.registry.list_all().await? {
            if job.state == JobState::Retrying {
                let delay = job
                    .retry_at
                    .map(|at| (at - Utc::now()).to_std().unwrap_or_default())
                    .unwrap_or_default();
                self.schedule_requeue(job.id, delay);
            }
        }

        Ok(failed)
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Cancel a job and, transitively, all its descendants.
    ///
    /// Cooperative: running tasks observe their token at the next
    /// suspension point. Idempotent: terminal jobs are left untouched.
    pub async fn cancel(&self, job_id: &str) -> Result<(), CoreError> {
        let job = self.registry.get(job_id).await?;

        match job.state {
            JobState::Success | JobState::Failure | JobState::Cancelled => {}
            JobState::Running => {
                let token = self.cancels.lock().await.get(job_id).cloned();
                match token {
                    Some(token) => token.cancel(),
                    None => {
                        // Running under a worker that is no longer around
                        self.registry
                            .transition(
                                job_id,
                                JobState::Cancelled,
                                JobPatch {
                                    error: Some(CoreError::Cancelled(
                                        "cancelled without a live worker".into(),
                                    )),
                                    ..JobPatch::default()
                                },
                            )
                            .await?;
                        self.notify_completion(job_id).await;
                    }
                }
            }
            JobState::Queued | JobState::Retrying => {
                self.registry
                    .transition(
                        job_id,
                        JobState::Cancelled,
                        JobPatch {
                            error: Some(CoreError::Cancelled("cancelled before execution".into())),
                            ..JobPatch::default()
                        },
                    )
                    .await?;
                self.notify_completion(job_id).await;
            }
        }

        for child in self.registry.list_children(job_id).await? {
            Box::pin(self.cancel(&child.id)).await?;
        }

        Ok(())
    }

    // ── Completion waiting ───────────────────────────────────────────

    async fn notify_completion(&self, job_id: &str) {
        if let Some(notify) = self.completions.lock().await.remove(job_id) {
            notify.notify_waiters();
        }
    }

    /// Wait until the job reaches a terminal state; returns its result
    /// or error.
    pub async fn await_terminal(&self, job_id: &str) -> Result<serde_json::Value, CoreError> {
        loop {
            let notified = {
                let mut completions = self.completions.lock().await;
                completions
                    .entry(job_id.to_string())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };

            let job = self.registry.get(job_id).await?;
            if job.state.is_terminal() {
                // Drop our completion slot so the map does not accumulate
                self.completions.lock().await.remove(job_id);
            }
            match job.state {
                JobState::Success => return Ok(job.result.unwrap_or(serde_json::Value::Null)),
                JobState::Failure => {
                    return Err(job
                        .error
                        .unwrap_or_else(|| CoreError::Internal("job failed without error".into())));
                }
                JobState::Cancelled => {
                    return Err(job
                        .error
                        .unwrap_or_else(|| CoreError::Cancelled("job cancelled".into())));
                }
                _ => {}
            }

            tokio::select! {
                _ = notified.notified() => {}
                _ = tokio::time::sleep(AWAIT_POLL_INTERVAL) => {}
            }
        }
    }
}
