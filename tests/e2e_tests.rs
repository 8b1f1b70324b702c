//! Service-level end-to-end scenarios, run against the assembled [`App`]
//! with fake runtime, LLM, and feed collaborators.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use scanforge::App;
use scanforge_core::{Config, CoreError, KvStore, MemoryKvStore};
use scanforge_llm::LlmProvider;
use scanforge_orchestrator::{JobPatch, JobState, TerminalEvent};
use scanforge_runner::{ContainerRuntime, TemplateSelector};

use common::{FakeLlm, ScriptedRuntime, wait_for};

const SCAN_SCRIPT: &str = "\
[INF] Current nuclei version: v3.1.0 (latest)\n\
[INF] New Scan Started with target example.com\n\
[tpl-header] [http] [medium] https://example.com/ [x-frame-options]\n\
[INF] scan completed in 3s. 1 matches found.\n";

const NO_RESULT_SCRIPT: &str = "\
[INF] New Scan Started with target example.com\n\
[INF] No results found. Better luck next time!\n";

fn upload_body() -> String {
    r#"id: custom-header-probe
info:
  name: Custom header probe
  author: tester
  severity: medium
http:
  - method: GET
    path:
      - "{{BaseURL}}/"
    matchers:
      - type: word
        words:
          - "x-frame-options"
"#
    .to_string()
}

struct ServiceHarness {
    app: App,
    kv: Arc<dyn KvStore>,
    runtime: Arc<ScriptedRuntime>,
    shutdown: CancellationToken,
    _library_dir: TempDir,
}

impl Drop for ServiceHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn service(runtime: Arc<ScriptedRuntime>, llm: Arc<FakeLlm>, feed_url: &str) -> ServiceHarness {
    let library_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.library.root = library_dir.path().to_path_buf();
    config.runner.pull_on_missing = false;
    config.runner.log_poll_millis = 20;
    config.runner.destroy_grace_seconds = 0;
    config.scheduler.retry.base_seconds = 0;
    config.scheduler.retry.cap_seconds = 0;
    config.pipeline.feed_url = feed_url.to_string();

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let runtime_port: Arc<dyn ContainerRuntime> = runtime.clone();
    let llm_port: Arc<dyn LlmProvider> = llm;
    let shutdown = CancellationToken::new();
    let app = App::build(config, kv.clone(), runtime_port, llm_port, shutdown.clone())
        .await
        .unwrap();
    app.start().await.unwrap();

    ServiceHarness {
        app,
        kv,
        runtime,
        shutdown,
        _library_dir: library_dir,
    }
}

async fn collect_log(harness: &ServiceHarness, container_name: &str) -> String {
    let mut rx = harness
        .app
        .stream_scan_log(container_name, 0)
        .await
        .unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend(chunk);
    }
    String::from_utf8(collected).unwrap()
}

#[tokio::test]
async fn happy_path_scan_completes_with_log_and_findings() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime.clone(), FakeLlm::new(vec![]), "http://unused.local").await;

    let receipt = harness
        .app
        .submit_scan("example.com", TemplateSelector::Dirs(vec!["http/".into()]))
        .await
        .unwrap();
    assert!(receipt.container_name.starts_with("nuclei_scan_"));

    let app = &harness.app;
    let job_id = receipt.job_id.clone();
    assert!(
        wait_for(
            || async {
                app.get_job(&job_id)
                    .await
                    .map(|job| job.state == JobState::Success)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );

    let job = app.get_job(&receipt.job_id).await.unwrap();
    let outcome: scanforge_orchestrator::ScanOutcome =
        serde_json::from_value(job.result.unwrap()).unwrap();
    assert_eq!(outcome.terminal_event, TerminalEvent::Completed);
    assert_eq!(outcome.findings_count, 1);

    let log = collect_log(&harness, &receipt.container_name).await;
    assert!(log.contains("[INF] New Scan Started"));

    let findings = harness.app.registry().findings(&receipt.job_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].template_id, "tpl-header");
}

#[tokio::test]
async fn invalid_target_is_rejected_before_any_job_or_container() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime.clone(), FakeLlm::new(vec![]), "http://unused.local").await;

    let err = harness
        .app
        .submit_scan("not-a-valid-target", TemplateSelector::Dirs(vec!["cves/".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    assert!(harness.app.registry().list_all().await.unwrap().is_empty());
    assert!(runtime.container_names().await.is_empty());
}

#[tokio::test]
async fn custom_template_upload_and_scan() {
    let runtime = ScriptedRuntime::fixed(NO_RESULT_SCRIPT, 0);
    let harness = service(runtime, FakeLlm::new(vec![]), "http://unused.local").await;
    let body = upload_body();

    // Upload is idempotent on the body
    let first = harness
        .app
        .upload_template(body.as_bytes(), "probe.yaml")
        .await
        .unwrap();
    let second = harness
        .app
        .upload_template(body.as_bytes(), "probe.yaml")
        .await
        .unwrap();
    assert_eq!(first, second);

    let receipt = harness
        .app
        .submit_custom_scan("example.com", body.as_bytes(), "probe.yaml")
        .await
        .unwrap();

    let app = &harness.app;
    let job_id = receipt.job_id.clone();
    assert!(
        wait_for(
            || async {
                app.get_job(&job_id)
                    .await
                    .map(|job| job.state == JobState::Success)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );

    let job = app.get_job(&receipt.job_id).await.unwrap();
    let outcome: scanforge_orchestrator::ScanOutcome =
        serde_json::from_value(job.result.unwrap()).unwrap();
    assert_eq!(outcome.terminal_event, TerminalEvent::NoResults);
}

#[tokio::test]
async fn invalid_upload_is_rejected() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime, FakeLlm::new(vec![]), "http://unused.local").await;

    let err = harness
        .app
        .upload_template(b"id: only-an-id", "bad.yaml")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn ai_scan_synthesizes_a_template_and_scans_with_it() {
    // Match only when the scan runs the synthesized custom template
    let runtime = ScriptedRuntime::new(|spec| {
        let command = spec.command.join(" ");
        if command.contains("/templates/custom/ai-") {
            (
                b"[custom-header-probe] [http] [medium] https://example.com/\n\
                  [INF] scan completed in 1s. 1 matches found.\n"
                    .to_vec(),
                0,
            )
        } else {
            (NO_RESULT_SCRIPT.as_bytes().to_vec(), 0)
        }
    });
    let llm = FakeLlm::new(vec![&format!("```yaml\n{}```", upload_body())]);
    let harness = service(runtime, llm, "http://unused.local").await;

    let receipt = harness
        .app
        .submit_ai_scan("example.com", "check for missing clickjacking protection")
        .await
        .unwrap();

    let app = &harness.app;
    let job_id = receipt.job_id.clone();
    assert!(
        wait_for(
            || async {
                app.get_job(&job_id)
                    .await
                    .map(|job| job.state.is_terminal())
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );

    let job = app.get_job(&receipt.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Success);
    let result = job.result.unwrap();
    assert!(result.get("template_id").is_some());

    let findings = app.registry().findings(&receipt.job_id).await.unwrap();
    assert_eq!(findings.len(), 1);
}

#[tokio::test]
async fn cancellation_destroys_the_container_and_keeps_delivered_chunks() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    runtime.hold.store(true, Ordering::SeqCst);
    let harness = service(runtime.clone(), FakeLlm::new(vec![]), "http://unused.local").await;

    let receipt = harness
        .app
        .submit_scan("example.com", TemplateSelector::All)
        .await
        .unwrap();

    // Wait until the scan is running and its log has been pumped
    let registry = harness.app.registry();
    let job_id = receipt.job_id.clone();
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

    harness.app.cancel_job(&receipt.job_id).await.unwrap();

    let app = &harness.app;
    assert!(
        wait_for(
            || async {
                app.get_job(&job_id)
                    .await
                    .map(|job| job.state == JobState::Cancelled)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );

    // Container destroyed within the grace window
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

    // Chunks delivered before cancellation are still replayable
    let log = collect_log(&harness, &receipt.container_name).await;
    assert_eq!(log, SCAN_SCRIPT);

    // Cancellation is idempotent
    harness.app.cancel_job(&receipt.job_id).await.unwrap();
}

#[tokio::test]
async fn worker_loss_is_recovered_on_startup() {
    let library_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.library.root = library_dir.path().to_path_buf();
    config.runner.pull_on_missing = false;

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let runtime_port: Arc<dyn ContainerRuntime> = runtime.clone();
    let llm_port: Arc<dyn LlmProvider> = FakeLlm::new(vec![]);
    let shutdown = CancellationToken::new();
    let app = App::build(config, kv.clone(), runtime_port, llm_port, shutdown.clone())
        .await
        .unwrap();

    // A job left `running` by a worker that died without cleanup
    let registry = app.registry();
    let orphan = registry
        .create(
            scanforge_orchestrator::JobKind::Scan,
            scanforge_orchestrator::JobPayload::Scan {
                target: "example.com".into(),
                selector: TemplateSelector::All,
            },
            None,
        )
        .await
        .unwrap();
    registry
        .transition(
            &orphan.id,
            JobState::Running,
            JobPatch {
                worker_id: Some("worker:departed".into()),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();

    // Startup recovery runs before workers accept new tasks
    app.start().await.unwrap();

    let recovered = registry.get(&orphan.id).await.unwrap();
    assert_eq!(recovered.state, JobState::Failure);
    assert!(matches!(recovered.error, Some(CoreError::WorkerLost(_))));

    // No orphan containers remain
    assert!(runtime.container_names().await.is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn pipeline_trigger_is_idempotent_and_metrics_are_readable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"vulnerabilities": []})),
        )
        .mount(&server)
        .await;

    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime, FakeLlm::new(vec![]), &server.uri()).await;

    let first = harness
        .app
        .trigger_pipeline(Some("run-e2e".into()))
        .await
        .unwrap();
    let second = harness
        .app
        .trigger_pipeline(Some("run-e2e".into()))
        .await
        .unwrap();
    assert_eq!(first, second);

    let metrics = harness.app.get_pipeline_metrics(Some("run-e2e")).await.unwrap();
    assert_eq!(metrics.len(), 5);
    assert!(metrics.values().all(|count| *count == 0));

    let global = harness.app.get_pipeline_metrics(None).await.unwrap();
    assert!(global.contains_key("templates_generated"));
}

#[tokio::test]
async fn container_status_resolves_by_name() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime, FakeLlm::new(vec![]), "http://unused.local").await;

    let receipt = harness
        .app
        .submit_scan("example.com", TemplateSelector::All)
        .await
        .unwrap();

    let status = harness
        .app
        .get_container_status(&receipt.container_name)
        .await
        .unwrap();
    assert_eq!(status.job_id, receipt.job_id);

    let err = harness
        .app
        .get_container_status("nuclei_scan_does_not_exist")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn submitted_jobs_are_visible_through_the_shared_kv() {
    let runtime = ScriptedRuntime::fixed(SCAN_SCRIPT, 0);
    let harness = service(runtime, FakeLlm::new(vec![]), "http://unused.local").await;

    harness
        .app
        .submit_scan("example.com", TemplateSelector::All)
        .await
        .unwrap();
    let keys = harness.kv.keys("job:*").await.unwrap();
    assert_eq!(keys.len(), 1);
}
