//! Task handlers for the synthesis pipeline and AI scans.
//!
//! The pipeline is a state machine composed from scheduler primitives:
//!
//! ```text
//! fetch_cves ▸ partition_by_novelty ▸ group{ generate_template }
//!   ▸ store_templates ▸ group{ validate_template ▸? refine_loop }
//! ```
//!
//! Each stage is a real job in the registry; the root job orchestrates
//! them and owns the run record.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use scanforge_core::config::{LlmConfig, PipelineConfig};
use scanforge_core::{CoreError, KvStore, KvStoreExt};
use scanforge_llm::{CompletionRequest, LlmError, LlmProvider, ResponseParser, prompts};
use scanforge_orchestrator::application::handlers::ScanTaskHandler;
use scanforge_orchestrator::{
    JobKind, JobPayload, Scheduler, SubmitOptions, TaskContext, TaskHandler, TaskSpec,
};
use scanforge_runner::TemplateSelector;

use crate::application::pipeline::{PipelineMetrics, RunState, TemplatePipeline};
use crate::domain::cve::CveRecord;
use crate::domain::template::{ValidationState, validate_structure};
use crate::infrastructure::feed::{CveFeedClient, FeedError};
use crate::infrastructure::library::TemplateLibrary;

/// Deterministic sampling seed, fixed per pipeline run.
fn run_seed(run_id: &str) -> u64 {
    let digest = Sha256::digest(run_id.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest has 8 bytes"))
}

fn llm_to_core(err: LlmError) -> CoreError {
    if err.is_retryable() {
        CoreError::LlmUnavailable(err.to_string())
    } else {
        CoreError::InvalidOutput(err.to_string())
    }
}

/// Result of one `generate_template` job.
#[derive(Debug, Serialize, Deserialize)]
pub struct GeneratedTemplate {
    pub cve_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of one stored template, handed to the validation group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTemplate {
    pub template_id: String,
    pub cve_id: String,
    /// Library-relative path.
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ValidationVerdict {
    valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diagnostic: Option<String>,
}

// ── fetch_cves ───────────────────────────────────────────────────────

/// Fetches the CVE window and keeps only records not yet in the cache.
pub struct FetchCvesHandler {
    feed: Arc<CveFeedClient>,
    kv: Arc<dyn KvStore>,
    cve_ttl: Duration,
}

impl FetchCvesHandler {
    pub fn new(feed: Arc<CveFeedClient>, kv: Arc<dyn KvStore>, cve_ttl: Duration) -> Self {
        Self { feed, kv, cve_ttl }
    }
}

#[async_trait]
impl TaskHandler for FetchCvesHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::FetchCves { window_days } = &ctx.job.payload else {
            return Err(CoreError::Internal("fetch handler got a foreign payload".into()));
        };

        // Yesterday-anchored window: the feed's current day is incomplete
        let end = Utc::now() - ChronoDuration::days(1);
        let start = end - ChronoDuration::days(window_days - 1);

        let fetched = self.feed.fetch_window(start, end).await.map_err(|e| match e {
            FeedError::Timeout(s) => CoreError::Timeout(format!("CVE feed after {s}s")),
            other => CoreError::FeedUnavailable(other.to_string()),
        })?;

        // Novelty partition: first writer wins the cache slot
        let mut novel = Vec::new();
        for record in fetched {
            let inserted = self
                .kv
                .set_nx_json(
                    &CveRecord::cache_key(&record.cve_id),
                    &record,
                    Some(self.cve_ttl),
                )
                .await
                .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
            if inserted {
                novel.push(record);
            }
        }

        info!(job_id = %ctx.job.id, novel = novel.len(), "CVE fetch complete");
        serde_json::to_value(&novel).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── generate_template ────────────────────────────────────────────────

/// Renders a CVE into a prompt and asks the LLM for a template.
///
/// Parse failures burn in-handler attempts; transport failures surface
/// as retryable errors for the scheduler. After the attempt budget the
/// job still succeeds, carrying a skipped marker, so one stubborn CVE
/// never poisons the run.
pub struct GenerateTemplateHandler {
    llm: Arc<dyn LlmProvider>,
    library: Arc<TemplateLibrary>,
    config: LlmConfig,
}

impl GenerateTemplateHandler {
    pub fn new(llm: Arc<dyn LlmProvider>, library: Arc<TemplateLibrary>, config: LlmConfig) -> Self {
        Self {
            llm,
            library,
            config,
        }
    }
}

#[async_trait]
impl TaskHandler for GenerateTemplateHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::GenerateTemplate {
            cve_id,
            description,
            run_id,
        } = &ctx.job.payload
        else {
            return Err(CoreError::Internal("generate handler got a foreign payload".into()));
        };

        // A template generated by an earlier run is reused as-is
        if let Ok(existing) = self.library.get(cve_id).await {
            info!(cve_id = %cve_id, "Template already in library, skipping generation");
            let result = GeneratedTemplate {
                cve_id: cve_id.clone(),
                body: Some(existing.body),
                skipped: false,
                reason: None,
            };
            return serde_json::to_value(&result).map_err(|e| CoreError::Internal(e.to_string()));
        }

        let prompt = prompts::generation_prompt(cve_id, description);
        let seed = run_seed(run_id);
        let mut last_reason = String::new();

        for attempt in 1..=self.config.max_generate_attempts {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled("generation cancelled".into()));
            }

            let request = CompletionRequest::new(prompt.clone())
                .with_temperature(self.config.temperature.min(0.2))
                .with_seed(seed);

            let response = match self.llm.complete(request).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => return Err(llm_to_core(e)),
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            };

            let body = ResponseParser::extract_yaml(&response.text);
            match validate_structure(&body) {
                Ok(doc) if doc.id.eq_ignore_ascii_case(cve_id) => {
                    info!(cve_id = %cve_id, attempt, "Template generated");
                    let result = GeneratedTemplate {
                        cve_id: cve_id.clone(),
                        body: Some(body),
                        skipped: false,
                        reason: None,
                    };
                    return serde_json::to_value(&result)
                        .map_err(|e| CoreError::Internal(e.to_string()));
                }
                Ok(doc) => {
                    last_reason = format!("template id {:?} does not match {cve_id}", doc.id);
                }
                Err(e) => {
                    last_reason = e.to_string();
                }
            }
            warn!(cve_id = %cve_id, attempt, reason = %last_reason, "Generated template rejected");
        }

        let result = GeneratedTemplate {
            cve_id: cve_id.clone(),
            body: None,
            skipped: true,
            reason: Some(last_reason),
        };
        serde_json::to_value(&result).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── store_templates ──────────────────────────────────────────────────

/// Persists the generation group's output into the template library.
pub struct StoreTemplatesHandler {
    library: Arc<TemplateLibrary>,
    metrics: PipelineMetrics,
}

impl StoreTemplatesHandler {
    pub fn new(library: Arc<TemplateLibrary>, metrics: PipelineMetrics) -> Self {
        Self { library, metrics }
    }
}

#[async_trait]
impl TaskHandler for StoreTemplatesHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::StoreTemplates { run_id } = &ctx.job.payload else {
            return Err(CoreError::Internal("store handler got a foreign payload".into()));
        };
        let generated: Vec<GeneratedTemplate> = ctx
            .job
            .input
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoreError::InvalidOutput(format!("store stage input: {e}")))?
            .unwrap_or_default();

        let mut stored = Vec::new();
        for item in generated {
            if item.skipped {
                warn!(cve_id = %item.cve_id, reason = ?item.reason, "Skipping template with no usable generation");
                continue;
            }
            let Some(body) = item.body else { continue };
            match self.library.store_generated(&item.cve_id, &body, 0).await {
                Ok(template) => {
                    self.metrics.incr(run_id, "templates_generated").await;
                    let path = self
                        .library
                        .relative_path(&template.template_id)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    stored.push(StoredTemplate {
                        template_id: template.template_id,
                        cve_id: item.cve_id,
                        path,
                    });
                }
                Err(e) => {
                    // One bad template never aborts the batch
                    warn!(cve_id = %item.cve_id, error = %e, "Failed to store template");
                }
            }
        }

        info!(job_id = %ctx.job.id, stored = stored.len(), "Templates stored");
        serde_json::to_value(&stored).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── validate_template ────────────────────────────────────────────────

/// Validates one template by scanning the reference target with it.
///
/// Success: at least one finding whose template id matches and whose
/// severity is at least the template's declared severity. The verdict is
/// the job's result either way; a scan-level failure becomes an invalid
/// verdict carrying the error as the diagnostic.
pub struct ValidateTemplateHandler {
    scheduler: Arc<Scheduler>,
    library: Arc<TemplateLibrary>,
    metrics: PipelineMetrics,
    reference_target: String,
}

impl ValidateTemplateHandler {
    pub fn new(
        scheduler: Arc<Scheduler>,
        library: Arc<TemplateLibrary>,
        metrics: PipelineMetrics,
        reference_target: String,
    ) -> Self {
        Self {
            scheduler,
            library,
            metrics,
            reference_target,
        }
    }
}

#[async_trait]
impl TaskHandler for ValidateTemplateHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::ValidateTemplate {
            template_id,
            template_path,
            attempt,
            run_id,
            ..
        } = &ctx.job.payload
        else {
            return Err(CoreError::Internal("validate handler got a foreign payload".into()));
        };

        let template = self
            .library
            .get(template_id)
            .await
            .map_err(|e| CoreError::NotFound(e.to_string()))?;
        let declared = validate_structure(&template.body)
            .map_err(|e| CoreError::InvalidOutput(e.to_string()))?
            .severity;
        let _ = self
            .library
            .set_validation_state(template_id, ValidationState::Validating);

        let scan_job = self
            .scheduler
            .submit(
                JobKind::Scan,
                JobPayload::Scan {
                    target: self.reference_target.clone(),
                    selector: TemplateSelector::File(template_path.into()),
                },
                SubmitOptions {
                    parent_id: Some(ctx.job.id.clone()),
                    ..SubmitOptions::default()
                },
            )
            .await?;

        let verdict = match self.scheduler.await_terminal(&scan_job.id).await {
            Ok(_outcome) => {
                let findings = ctx.registry.findings(&scan_job.id).await?;
                let matched = findings.iter().any(|finding| {
                    finding.template_id.eq_ignore_ascii_case(template_id)
                        && finding.severity >= declared
                });
                if matched {
                    ValidationVerdict {
                        valid: true,
                        diagnostic: None,
                    }
                } else {
                    // Tail of the scan log is the refinement diagnostic
                    let (log, _) = ctx.registry.read_log(&scan_job.id, 0).await?;
                    let tail_start = log.len().saturating_sub(2048);
                    ValidationVerdict {
                        valid: false,
                        diagnostic: Some(format!(
                            "no matching finding on {}; scan output tail:\n{}",
                            self.reference_target,
                            String::from_utf8_lossy(&log[tail_start..])
                        )),
                    }
                }
            }
            Err(e) => ValidationVerdict {
                valid: false,
                diagnostic: Some(format!("validation scan failed: {e}")),
            },
        };

        if verdict.valid {
            info!(template_id = %template_id, attempt, "Template validated");
            self.metrics.incr(run_id, "templates_validated").await;
        } else {
            info!(template_id = %template_id, attempt, "Template validation failed");
            self.metrics.incr(run_id, "validations_failed").await;
        }

        serde_json::to_value(&verdict).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── refine_template ──────────────────────────────────────────────────

/// Asks the LLM to correct a template that failed validation and stores
/// the refined document as the next generation attempt.
pub struct RefineTemplateHandler {
    llm: Arc<dyn LlmProvider>,
    library: Arc<TemplateLibrary>,
    config: LlmConfig,
}

impl RefineTemplateHandler {
    pub fn new(llm: Arc<dyn LlmProvider>, library: Arc<TemplateLibrary>, config: LlmConfig) -> Self {
        Self {
            llm,
            library,
            config,
        }
    }
}

#[async_trait]
impl TaskHandler for RefineTemplateHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::RefineTemplate {
            cve_id,
            template_id,
            failure,
            refinement,
            run_id,
            ..
        } = &ctx.job.payload
        else {
            return Err(CoreError::Internal("refine handler got a foreign payload".into()));
        };

        let current = self
            .library
            .get(template_id)
            .await
            .map_err(|e| CoreError::NotFound(e.to_string()))?;

        let request = CompletionRequest::new(prompts::refinement_prompt(
            cve_id,
            &current.body,
            failure,
        ))
        .with_temperature(self.config.temperature.min(0.2))
        .with_seed(run_seed(run_id));

        let response = self.llm.complete(request).await.map_err(llm_to_core)?;
        let body = ResponseParser::extract_yaml(&response.text);
        let doc = validate_structure(&body).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
        if !doc.id.eq_ignore_ascii_case(cve_id) {
            return Err(CoreError::InvalidOutput(format!(
                "refined template id {:?} does not match {cve_id}",
                doc.id
            )));
        }

        let template = self
            .library
            .store_generated(cve_id, &body, *refinement)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let path = self
            .library
            .relative_path(&template.template_id)
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        info!(cve_id = %cve_id, refinement, "Template refined");
        serde_json::to_value(&StoredTemplate {
            template_id: template.template_id,
            cve_id: cve_id.clone(),
            path,
        })
        .map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── pipeline_root ────────────────────────────────────────────────────

/// Summary returned by a pipeline root job.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub cves: usize,
    pub generated: usize,
    pub validated: usize,
    pub exhausted: usize,
}

/// Orchestrates one pipeline run as a chain of scheduler tasks.
pub struct PipelineRootHandler {
    scheduler: Arc<Scheduler>,
    library: Arc<TemplateLibrary>,
    metrics: PipelineMetrics,
    kv: Arc<dyn KvStore>,
    config: PipelineConfig,
}

impl PipelineRootHandler {
    pub fn new(
        scheduler: Arc<Scheduler>,
        library: Arc<TemplateLibrary>,
        metrics: PipelineMetrics,
        kv: Arc<dyn KvStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            scheduler,
            library,
            metrics,
            kv,
            config,
        }
    }

    /// `validate_template ▸? refine_loop` for one stored template.
    /// Returns whether the template ended up valid.
    async fn validate_refine_loop(
        &self,
        root_id: &str,
        run_id: &str,
        stored: StoredTemplate,
    ) -> bool {
        let mut current = stored;
        let mut refinement = 0u32;

        loop {
            let verdict = self
                .scheduler
                .run_task(
                    TaskSpec::new(
                        JobKind::ValidateTemplate,
                        JobPayload::ValidateTemplate {
                            template_id: current.template_id.clone(),
                            cve_id: current.cve_id.clone(),
                            template_path: current.path.clone(),
                            attempt: refinement + 1,
                            run_id: run_id.to_string(),
                        },
                    ),
                    Some(root_id.to_string()),
                    None,
                )
                .await;

            let (valid, diagnostic) = match verdict {
                Ok(value) => {
                    let verdict: ValidationVerdict =
                        serde_json::from_value(value).unwrap_or(ValidationVerdict {
                            valid: false,
                            diagnostic: Some("unreadable validation verdict".into()),
                        });
                    (verdict.valid, verdict.diagnostic.unwrap_or_default())
                }
                Err(e) => (false, e.to_string()),
            };

            if valid {
                let _ = self
                    .library
                    .set_validation_state(&current.template_id, ValidationState::Valid);
                return true;
            }

            if refinement >= self.config.max_refinements {
                warn!(
                    template_id = %current.template_id,
                    refinements = refinement,
                    "Refinement budget exhausted"
                );
                let _ = self
                    .library
                    .set_validation_state(&current.template_id, ValidationState::InvalidMaxRetries);
                self.metrics.incr(run_id, "refinements_exhausted").await;
                return false;
            }

            refinement += 1;
            self.metrics.incr(run_id, "refinements_attempted").await;

            match self
                .scheduler
                .run_task(
                    TaskSpec::new(
                        JobKind::RefineTemplate,
                        JobPayload::RefineTemplate {
                            cve_id: current.cve_id.clone(),
                            template_id: current.template_id.clone(),
                            template_path: current.path.clone(),
                            failure: diagnostic,
                            refinement,
                            run_id: run_id.to_string(),
                        },
                    ),
                    Some(root_id.to_string()),
                    None,
                )
                .await
            {
                Ok(value) => {
                    if let Ok(refined) = serde_json::from_value::<StoredTemplate>(value) {
                        current = refined;
                    }
                }
                Err(e) => {
                    // Attempt consumed; revalidate the unrefined template
                    warn!(template_id = %current.template_id, error = %e, "Refinement failed");
                }
            }
        }
    }
}

#[async_trait]
impl TaskHandler for PipelineRootHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::PipelineRoot { run_id } = &ctx.job.payload else {
            return Err(CoreError::Internal("pipeline root got a foreign payload".into()));
        };
        let run_id = run_id.clone();
        let root_id = ctx.job.id.clone();

        let outcome: Result<RunSummary, CoreError> = async {
            // fetch_cves
            let fetched = self
                .scheduler
                .run_task(
                    TaskSpec::new(
                        JobKind::FetchCves,
                        JobPayload::FetchCves {
                            window_days: self.config.cve_window_days,
                        },
                    ),
                    Some(root_id.clone()),
                    None,
                )
                .await?;
            let novel: Vec<CveRecord> = serde_json::from_value(fetched)
                .map_err(|e| CoreError::Internal(format!("fetch stage result: {e}")))?;

            TemplatePipeline::update_run(&self.kv, &run_id, |run| {
                // Re-assert ownership: this write may race the trigger's
                // root_job_id update on a freshly created record
                run.root_job_id = Some(root_id.clone());
                run.cve_batch = novel.iter().map(|r| r.cve_id.clone()).collect();
            })
            .await?;

            if novel.is_empty() {
                info!(run_id = %run_id, "No novel CVEs, pipeline run complete");
                return Ok(RunSummary {
                    run_id: run_id.clone(),
                    cves: 0,
                    generated: 0,
                    validated: 0,
                    exhausted: 0,
                });
            }

            // group{ generate_template }
            let generate_specs = novel
                .iter()
                .map(|record| {
                    TaskSpec::new(
                        JobKind::GenerateTemplate,
                        JobPayload::GenerateTemplate {
                            cve_id: record.cve_id.clone(),
                            description: record.description.clone(),
                            run_id: run_id.clone(),
                        },
                    )
                })
                .collect();
            let generated = self
                .scheduler
                .run_group(generate_specs, Some(root_id.clone()))
                .await;

            // The group's result vector feeds store_templates verbatim;
            // failed children become skipped markers
            let store_input: Vec<serde_json::Value> = generated
                .into_iter()
                .zip(novel.iter())
                .map(|(result, record)| match result {
                    Ok(value) => value,
                    Err(e) => serde_json::json!({
                        "cve_id": record.cve_id,
                        "skipped": true,
                        "reason": e.to_string(),
                    }),
                })
                .collect();

            // store_templates
            let stored_value = self
                .scheduler
                .run_task(
                    TaskSpec::new(
                        JobKind::StoreTemplates,
                        JobPayload::StoreTemplates {
                            run_id: run_id.clone(),
                        },
                    ),
                    Some(root_id.clone()),
                    Some(serde_json::Value::Array(store_input)),
                )
                .await?;
            let stored: Vec<StoredTemplate> = serde_json::from_value(stored_value)
                .map_err(|e| CoreError::Internal(format!("store stage result: {e}")))?;

            // group{ validate_template ▸? refine_loop }
            let results = join_all(
                stored
                    .iter()
                    .cloned()
                    .map(|template| self.validate_refine_loop(&root_id, &run_id, template)),
            )
            .await;

            let validated = results.iter().filter(|valid| **valid).count();
            Ok(RunSummary {
                run_id: run_id.clone(),
                cves: novel.len(),
                generated: stored.len(),
                validated,
                exhausted: results.len() - validated,
            })
        }
        .await;

        let final_state = if outcome.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        if let Err(e) = TemplatePipeline::update_run(&self.kv, &run_id, |run| {
            run.root_job_id = Some(root_id.clone());
            run.state = final_state;
        })
        .await
        {
            warn!(run_id = %run_id, error = %e, "Failed to finalize pipeline run record");
        }

        let summary = outcome?;
        info!(
            run_id = %run_id,
            cves = summary.cves,
            generated = summary.generated,
            validated = summary.validated,
            "Pipeline run finished"
        );
        serde_json::to_value(&summary).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ── ai_scan ──────────────────────────────────────────────────────────

/// Synthesizes a one-off template from a natural-language description,
/// stores it, and runs the scan in place (reusing the scan task so the
/// findings and log land on this job).
pub struct AiScanHandler {
    llm: Arc<dyn LlmProvider>,
    library: Arc<TemplateLibrary>,
    scan: Arc<ScanTaskHandler>,
    config: LlmConfig,
}

impl AiScanHandler {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        library: Arc<TemplateLibrary>,
        scan: Arc<ScanTaskHandler>,
        config: LlmConfig,
    ) -> Self {
        Self {
            llm,
            library,
            scan,
            config,
        }
    }
}

#[async_trait]
impl TaskHandler for AiScanHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, CoreError> {
        let JobPayload::AiScan {
            target,
            description,
        } = &ctx.job.payload
        else {
            return Err(CoreError::Internal("ai scan handler got a foreign payload".into()));
        };

        let request = CompletionRequest::new(prompts::ad_hoc_prompt(description))
            .with_temperature(self.config.temperature.min(0.2));
        let response = self.llm.complete(request).await.map_err(llm_to_core)?;
        let body = ResponseParser::extract_yaml(&response.text);
        validate_structure(&body).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;

        let template = self
            .library
            .store_ad_hoc(&body)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let path = self
            .library
            .relative_path(&template.template_id)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        info!(job_id = %ctx.job.id, template_id = %template.template_id, "Ad-hoc template synthesized");

        let mut scan_job = ctx.job.clone();
        scan_job.payload = JobPayload::CustomScan {
            target: target.clone(),
            template_path: path.display().to_string(),
        };
        let mut outcome = self
            .scan
            .handle(TaskContext {
                job: scan_job,
                registry: ctx.registry.clone(),
                cancel: ctx.cancel.clone(),
            })
            .await?;

        if let Some(object) = outcome.as_object_mut() {
            object.insert(
                "template_id".to_string(),
                serde_json::Value::String(template.template_id),
            );
        }
        Ok(outcome)
    }
}
