//! Scheduler integration tests: dispatch, retries, cancellation,
//! composition, and the scan task end to end against a scripted runtime.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use scanforge_core::config::{RunnerConfig, SchedulerConfig};
use scanforge_core::{CoreError, KvStore, MemoryKvStore};
use scanforge_orchestrator::application::handlers::ScanTaskHandler;
use scanforge_orchestrator::{
    Job, JobKind, JobPayload, JobRegistry, JobState, Scheduler, SubmitOptions, TaskSpec,
};
use scanforge_runner::{ContainerRunner, TemplateSelector};

use common::{
    BlockUntilCancelledHandler, EchoInputHandler, FlakyHandler, InvalidInputHandler, OkHandler,
    ScriptedRuntime, test_scheduler_config, wait_for,
};

const SCRIPT: &str = "\
[INF] Current nuclei version: v3.1.0 (latest)\n\
[INF] New Scan Started with target example.com\n\
[tpl-sqli] [http] [high] https://example.com/login\n\
[INF] scan completed in 4s. 1 matches found.\n";

struct Harness {
    scheduler: Arc<Scheduler>,
    registry: Arc<JobRegistry>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(config: SchedulerConfig) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let registry = Arc::new(JobRegistry::new(kv.clone(), None));
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            kv,
            config,
            shutdown.clone(),
        ));
        Self {
            scheduler,
            registry,
            shutdown,
        }
    }

    fn start(config: SchedulerConfig) -> Self {
        let harness = Self::new(config);
        harness.scheduler.spawn_workers();
        harness
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fetch_payload() -> JobPayload {
    JobPayload::FetchCves { window_days: 7 }
}

#[tokio::test]
async fn dispatch_runs_the_registered_handler() {
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::FetchCves,
        Arc::new(OkHandler(serde_json::json!({"cves": 3}))),
    );

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();

    let result = harness.scheduler.await_terminal(&job.id).await.unwrap();
    assert_eq!(result, serde_json::json!({"cves": 3}));

    let done = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Success);
    assert!(done.started_at.unwrap() <= done.finished_at.unwrap());
    assert_eq!(done.worker_id.as_deref(), Some(harness.scheduler.worker_id()));
}

#[tokio::test]
async fn retryable_failures_are_retried_with_attempt_tracking() {
    let harness = Harness::start(test_scheduler_config());
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, Arc::new(FlakyHandler::failing(2)));

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();

    let result = harness.scheduler.await_terminal(&job.id).await.unwrap();
    assert_eq!(result, serde_json::json!({"ok": true}));

    let done = harness.registry.get(&job.id).await.unwrap();
    // Two failures before success on the third attempt
    assert_eq!(done.attempt, 3);
    assert_eq!(done.state, JobState::Success);
}

#[tokio::test]
async fn retry_budget_exhaustion_is_a_terminal_failure() {
    let harness = Harness::start(test_scheduler_config());
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, Arc::new(FlakyHandler::failing(10)));

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();

    let err = harness.scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::KvUnavailable(_)));

    let done = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Failure);
    assert_eq!(done.attempt, JobKind::FetchCves.default_max_attempts());
}

#[tokio::test]
async fn caller_errors_are_never_retried() {
    let harness = Harness::start(test_scheduler_config());
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, Arc::new(InvalidInputHandler));

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();

    let err = harness.scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    let done = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(done.attempt, 1);
}

#[tokio::test]
async fn queue_soft_cap_sheds_load() {
    let mut config = test_scheduler_config();
    config.queue_soft_cap = 2;
    // No workers: submissions pile up in the queue
    let harness = Harness::new(config);

    harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();
    harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();
    let err = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::QueueFull(_)));
}

#[tokio::test]
async fn cancelling_a_queued_job_never_runs_it() {
    // No workers, so the job stays queued
    let harness = Harness::new(test_scheduler_config());

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();
    harness.scheduler.cancel(&job.id).await.unwrap();

    let cancelled = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.finished_at.is_some());

    // Idempotent
    harness.scheduler.cancel(&job.id).await.unwrap();
}

#[tokio::test]
async fn cancelling_a_running_job_is_cooperative() {
    let harness = Harness::start(test_scheduler_config());
    let handler = Arc::new(BlockUntilCancelledHandler::new());
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, handler.clone());

    let job = harness
        .scheduler
        .submit(JobKind::FetchCves, fetch_payload(), SubmitOptions::default())
        .await
        .unwrap();

    assert!(
        wait_for(
            || async { handler.running.load(Ordering::SeqCst) },
            Duration::from_secs(5)
        )
        .await
    );

    harness.scheduler.cancel(&job.id).await.unwrap();
    let err = harness.scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)));
    assert_eq!(
        harness.registry.get(&job.id).await.unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn cancellation_propagates_to_descendants() {
    // No workers: the whole tree stays queued
    let harness = Harness::new(test_scheduler_config());

    let root = harness
        .scheduler
        .submit(
            JobKind::PipelineRoot,
            JobPayload::PipelineRoot { run_id: "r1".into() },
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let child = harness
        .scheduler
        .submit(
            JobKind::FetchCves,
            fetch_payload(),
            SubmitOptions {
                parent_id: Some(root.id.clone()),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    harness.scheduler.cancel(&root.id).await.unwrap();
    assert_eq!(harness.registry.get(&root.id).await.unwrap().state, JobState::Cancelled);
    assert_eq!(harness.registry.get(&child.id).await.unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn recover_fails_jobs_from_dead_workers() {
    let harness = Harness::new(test_scheduler_config());

    // A job left `running` by a worker that never heartbeats
    let job = harness
        .registry
        .create(JobKind::FetchCves, fetch_payload(), None)
        .await
        .unwrap();
    harness
        .registry
        .transition(
            &job.id,
            JobState::Running,
            scanforge_orchestrator::JobPatch {
                worker_id: Some("worker:departed".into()),
                ..scanforge_orchestrator::JobPatch::default()
            },
        )
        .await
        .unwrap();

    let failed = harness.scheduler.recover().await.unwrap();
    assert_eq!(failed, vec![job.id.clone()]);

    let done = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Failure);
    assert!(matches!(done.error, Some(CoreError::WorkerLost(_))));
}

#[tokio::test]
async fn chains_pass_results_as_inputs_and_abort_on_failure() {
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::FetchCves,
        Arc::new(OkHandler(serde_json::json!(["CVE-1"]))),
    );
    harness
        .scheduler
        .register_handler(JobKind::StoreTemplates, Arc::new(EchoInputHandler));

    let result = harness
        .scheduler
        .run_chain(
            vec![
                TaskSpec::new(JobKind::FetchCves, fetch_payload()),
                TaskSpec::new(
                    JobKind::StoreTemplates,
                    JobPayload::StoreTemplates { run_id: "r1".into() },
                ),
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({"received": ["CVE-1"]}));

    // A failing first stage aborts the chain
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, Arc::new(InvalidInputHandler));
    let err = harness
        .scheduler
        .run_chain(
            vec![
                TaskSpec::new(JobKind::FetchCves, fetch_payload()),
                TaskSpec::new(
                    JobKind::StoreTemplates,
                    JobPayload::StoreTemplates { run_id: "r2".into() },
                ),
            ],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn groups_preserve_per_child_outcomes() {
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::GenerateTemplate,
        Arc::new(OkHandler(serde_json::json!("generated"))),
    );
    harness
        .scheduler
        .register_handler(JobKind::FetchCves, Arc::new(InvalidInputHandler));

    let results = harness
        .scheduler
        .run_group(
            vec![
                TaskSpec::new(
                    JobKind::GenerateTemplate,
                    JobPayload::GenerateTemplate {
                        cve_id: "CVE-2024-0001".into(),
                        description: "d".into(),
                        run_id: "r".into(),
                    },
                ),
                TaskSpec::new(JobKind::FetchCves, fetch_payload()),
            ],
            None,
        )
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &serde_json::json!("generated"));
    assert!(matches!(results[1], Err(CoreError::InvalidInput(_))));
}

// ── Scan task end to end ─────────────────────────────────────────────

fn scan_runner(runtime: Arc<ScriptedRuntime>) -> Arc<ContainerRunner> {
    let config = RunnerConfig {
        pull_on_missing: false,
        log_poll_millis: 20,
        ..RunnerConfig::default()
    };
    Arc::new(ContainerRunner::new(runtime, config))
}

fn submit_scan(harness: &Harness) -> (Arc<Scheduler>, JobPayload) {
    (
        harness.scheduler.clone(),
        JobPayload::Scan {
            target: "example.com".into(),
            selector: TemplateSelector::Dirs(vec!["http/".into()]),
        },
    )
}

async fn terminal_scan_job(harness: &Harness, job: &Job) -> Job {
    harness.scheduler.await_terminal(&job.id).await.ok();
    harness.registry.get(&job.id).await.unwrap()
}

#[tokio::test]
async fn scan_job_produces_outcome_findings_and_log() {
    let runtime = ScriptedRuntime::new(SCRIPT, 0);
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::Scan,
        Arc::new(ScanTaskHandler::new(
            scan_runner(runtime.clone()),
            PathBuf::from("/tmp/templates"),
            Duration::from_secs(10),
        )),
    );

    let (scheduler, payload) = submit_scan(&harness);
    let job = scheduler
        .submit(JobKind::Scan, payload, SubmitOptions::default())
        .await
        .unwrap();
    let container_name = job.container_name.clone().expect("allocated synchronously");
    assert!(container_name.starts_with("nuclei_scan_"));

    let result = scheduler.await_terminal(&job.id).await.unwrap();
    let outcome: scanforge_orchestrator::ScanOutcome = serde_json::from_value(result).unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.findings_count, 1);
    assert_eq!(
        outcome.terminal_event,
        scanforge_orchestrator::TerminalEvent::Completed
    );

    let findings = harness.registry.findings(&job.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].template_id, "tpl-sqli");

    let (log, _) = harness.registry.read_log(&job.id, 0).await.unwrap();
    assert_eq!(String::from_utf8(log).unwrap(), SCRIPT);

    // Scan container is destroyed after the run
    assert!(runtime.container_names().await.is_empty());
    assert_eq!(runtime.removed_names().await, vec![container_name]);
}

#[tokio::test]
async fn scan_with_no_results_reports_no_results() {
    let script = "[INF] No results found. Better luck next time!\n";
    let runtime = ScriptedRuntime::new(script, 0);
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::Scan,
        Arc::new(ScanTaskHandler::new(
            scan_runner(runtime),
            PathBuf::from("/tmp/templates"),
            Duration::from_secs(10),
        )),
    );

    let (scheduler, payload) = submit_scan(&harness);
    let job = scheduler
        .submit(JobKind::Scan, payload, SubmitOptions::default())
        .await
        .unwrap();
    let result = scheduler.await_terminal(&job.id).await.unwrap();
    let outcome: scanforge_orchestrator::ScanOutcome = serde_json::from_value(result).unwrap();
    assert_eq!(
        outcome.terminal_event,
        scanforge_orchestrator::TerminalEvent::NoResults
    );
    assert_eq!(outcome.findings_count, 0);
}

#[tokio::test]
async fn scan_with_invalid_target_fails_before_any_container() {
    let runtime = ScriptedRuntime::new(SCRIPT, 0);
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::Scan,
        Arc::new(ScanTaskHandler::new(
            scan_runner(runtime.clone()),
            PathBuf::from("/tmp/templates"),
            Duration::from_secs(10),
        )),
    );

    let job = harness
        .scheduler
        .submit(
            JobKind::Scan,
            JobPayload::Scan {
                target: "not-a-valid-target".into(),
                selector: TemplateSelector::All,
            },
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    let err = harness.scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
    assert!(runtime.container_names().await.is_empty());
    assert!(runtime.removed_names().await.is_empty());
}

#[tokio::test]
async fn looping_scan_fails_with_partial_findings_retained() {
    let mut script = String::from("[tpl-one] [http] [high] https://example.com/x\n");
    for i in 0..45 {
        script.push_str(&format!("stuck on the same thing {}\n", i % 5));
    }
    let runtime = ScriptedRuntime::new(script, 0);
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::Scan,
        Arc::new(ScanTaskHandler::new(
            scan_runner(runtime.clone()),
            PathBuf::from("/tmp/templates"),
            Duration::from_secs(10),
        )),
    );

    let (scheduler, payload) = submit_scan(&harness);
    let job = scheduler
        .submit(JobKind::Scan, payload, SubmitOptions::default())
        .await
        .unwrap();

    let err = scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::LoopDetected(_)));

    // Findings accumulated before the loop stay available
    let findings = harness.registry.findings(&job.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    // Scans are not retried
    let done = terminal_scan_job(&harness, &job).await;
    assert_eq!(done.state, JobState::Failure);
    assert_eq!(done.attempt, 1);
    assert!(runtime.container_names().await.is_empty());
}

#[tokio::test]
async fn cancelling_a_running_scan_destroys_the_container_and_keeps_the_log() {
    let runtime = ScriptedRuntime::new(SCRIPT, 0);
    runtime.hold.store(true, Ordering::SeqCst);
    let harness = Harness::start(test_scheduler_config());
    harness.scheduler.register_handler(
        JobKind::Scan,
        Arc::new(ScanTaskHandler::new(
            scan_runner(runtime.clone()),
            PathBuf::from("/tmp/templates"),
            Duration::from_secs(60),
        )),
    );

    let (scheduler, payload) = submit_scan(&harness);
    let job = scheduler
        .submit(JobKind::Scan, payload, SubmitOptions::default())
        .await
        .unwrap();

    // Wait until the held container is up and its log has been pumped
    let registry = harness.registry.clone();
    let job_id = job.id.clone();
    assert!(
        wait_for(
            || {
                let registry = registry.clone();
                let job_id = job_id.clone();
                async move {
                    registry
                        .read_log(&job_id, 0)
                        .await
                        .map(|(bytes, _)| !bytes.is_empty())
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(5)
        )
        .await
    );

    scheduler.cancel(&job.id).await.unwrap();
    let err = scheduler.await_terminal(&job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)));

    let done = harness.registry.get(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Cancelled);

    // Chunks delivered before cancellation survive
    let (log, _) = harness.registry.read_log(&job.id, 0).await.unwrap();
    assert_eq!(String::from_utf8(log).unwrap(), SCRIPT);

    // The container is gone within the cancellation grace
    assert!(
        wait_for(
            || {
                let runtime = runtime.clone();
                async move { runtime.container_names().await.is_empty() }
            },
            Duration::from_secs(5)
        )
        .await
    );
}
