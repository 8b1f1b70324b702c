//! Application composition root and the semantic operation surface.
//!
//! [`App`] wires the runner, registry, scheduler, LLM, and pipeline
//! together and exposes the operations the HTTP collaborator translates
//! to routes: submit scans, stream logs, inspect jobs, cancel, trigger
//! the pipeline, read metrics, upload templates. Every collaborator is
//! injected, so tests run the whole service against fakes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scanforge_core::{Config, CoreError, KvStore, RedisKvStore};
use scanforge_llm::{LlmProvider, OllamaProvider};
use scanforge_orchestrator::application::handlers::ScanTaskHandler;
use scanforge_orchestrator::{
    Job, JobId, JobKind, JobPayload, JobRegistry, Scheduler, SubmitOptions,
};
use scanforge_pipeline::{
    AiScanHandler, CveFeedClient, FetchCvesHandler, GenerateTemplateHandler, PipelineRootHandler,
    RefineTemplateHandler, StoreTemplatesHandler, TemplateLibrary, TemplatePipeline, TriggerKind,
    ValidateTemplateHandler,
};
use scanforge_runner::{ContainerRunner, ContainerRuntime, ContainerState, DockerCliRuntime, Target, TemplateSelector};

/// What a scan submission returns: the job id for tracking plus the
/// container name, allocated up front.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub container_name: String,
}

/// Observed status of a scan container, resolved by name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerStatus {
    pub container_name: String,
    pub state: String,
    pub job_id: JobId,
    pub job_state: String,
}

/// The assembled service.
pub struct App {
    config: Config,
    kv: Arc<dyn KvStore>,
    registry: Arc<JobRegistry>,
    runner: Arc<ContainerRunner>,
    scheduler: Arc<Scheduler>,
    library: Arc<TemplateLibrary>,
    pipeline: Arc<TemplatePipeline>,
    shutdown: CancellationToken,
}

impl App {
    /// Production wiring: Redis, the Docker CLI, and an Ollama endpoint.
    pub async fn connect(config: Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::connect(&config.kv.url).await?);
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerCliRuntime::new(config.runner.docker_binary.clone()));
        let llm: Arc<dyn LlmProvider> = Arc::new(OllamaProvider::new(
            config.llm.endpoint.clone(),
            config.llm.model.clone(),
            Duration::from_secs(config.llm.timeout_seconds),
        ));
        Ok(Self::build(config, kv, runtime, llm, shutdown).await?)
    }

    /// Assemble the service from injected collaborators.
    pub async fn build(
        config: Config,
        kv: Arc<dyn KvStore>,
        runtime: Arc<dyn ContainerRuntime>,
        llm: Arc<dyn LlmProvider>,
        shutdown: CancellationToken,
    ) -> Result<Self, CoreError> {
        let job_ttl = match config.kv.job_ttl_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours * 3600)),
        };
        let registry = Arc::new(JobRegistry::new(kv.clone(), job_ttl));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            kv.clone(),
            config.scheduler.clone(),
            shutdown.clone(),
        ));
        let runner = Arc::new(ContainerRunner::new(runtime, config.runner.clone()));

        let library = Arc::new(TemplateLibrary::new(config.library.root.clone()));
        library
            .ensure_layout()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        library
            .rebuild_index()
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let pipeline = Arc::new(TemplatePipeline::new(scheduler.clone(), kv.clone()));
        let metrics = pipeline.metrics().clone();
        let feed = Arc::new(CveFeedClient::new(
            config.pipeline.feed_url.clone(),
            Duration::from_secs(30),
        ));

        // Handler registry, keyed by job kind
        let scan_handler = Arc::new(ScanTaskHandler::new(
            runner.clone(),
            config.library.root.clone(),
            Duration::from_secs(config.runner.scan_timeout_seconds),
        ));
        scheduler.register_handler(JobKind::Scan, scan_handler.clone());
        scheduler.register_handler(JobKind::CustomScan, scan_handler.clone());
        scheduler.register_handler(
            JobKind::AiScan,
            Arc::new(AiScanHandler::new(
                llm.clone(),
                library.clone(),
                scan_handler,
                config.llm.clone(),
            )),
        );
        scheduler.register_handler(
            JobKind::FetchCves,
            Arc::new(FetchCvesHandler::new(
                feed,
                kv.clone(),
                Duration::from_secs(config.kv.cve_ttl_hours * 3600),
            )),
        );
        scheduler.register_handler(
            JobKind::GenerateTemplate,
            Arc::new(GenerateTemplateHandler::new(
                llm.clone(),
                library.clone(),
                config.llm.clone(),
            )),
        );
        scheduler.register_handler(
            JobKind::StoreTemplates,
            Arc::new(StoreTemplatesHandler::new(library.clone(), metrics.clone())),
        );
        scheduler.register_handler(
            JobKind::ValidateTemplate,
            Arc::new(ValidateTemplateHandler::new(
                scheduler.clone(),
                library.clone(),
                metrics.clone(),
                config.pipeline.reference_target.clone(),
            )),
        );
        scheduler.register_handler(
            JobKind::RefineTemplate,
            Arc::new(RefineTemplateHandler::new(
                llm,
                library.clone(),
                config.llm.clone(),
            )),
        );
        scheduler.register_handler(
            JobKind::PipelineRoot,
            Arc::new(PipelineRootHandler::new(
                scheduler.clone(),
                library.clone(),
                metrics,
                kv.clone(),
                config.pipeline.clone(),
            )),
        );

        Ok(Self {
            config,
            kv,
            registry,
            runner,
            scheduler,
            library,
            pipeline,
            shutdown,
        })
    }

    /// Start workers and background maintenance, after crash recovery.
    pub async fn start(&self) -> Result<(), CoreError> {
        let recovered = self.scheduler.recover().await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered jobs from lost workers");
        }

        self.scheduler.spawn_workers();
        self.runner.clone().spawn_reaper(self.shutdown.clone());
        crate::workers::spawn_pipeline_schedule_worker(
            self.pipeline.clone(),
            &self.config,
            self.shutdown.clone(),
        );
        crate::workers::spawn_job_reaper_worker(
            self.registry.clone(),
            &self.config,
            self.shutdown.clone(),
        );

        info!("Scanforge service started");
        Ok(())
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn library(&self) -> Arc<TemplateLibrary> {
        self.library.clone()
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    // ── Semantic operations ──────────────────────────────────────────

    /// Submit a scan against a validated target.
    pub async fn submit_scan(
        &self,
        target: &str,
        selector: TemplateSelector,
    ) -> Result<SubmitReceipt, CoreError> {
        // Reject before any job or container exists
        let target = Target::parse(target).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let job = self
            .scheduler
            .submit(
                JobKind::Scan,
                JobPayload::Scan {
                    target: target.as_str().to_string(),
                    selector,
                },
                SubmitOptions::default(),
            )
            .await?;
        Ok(Self::receipt(job))
    }

    /// Validate and store an uploaded template body, then scan with it.
    pub async fn submit_custom_scan(
        &self,
        target: &str,
        template_body: &[u8],
        filename: &str,
    ) -> Result<SubmitReceipt, CoreError> {
        let target = Target::parse(target).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let body = std::str::from_utf8(template_body)
            .map_err(|_| CoreError::InvalidInput("template body is not UTF-8".into()))?;
        let template = self
            .library
            .store_upload(body, filename)
            .await
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let template_path = self
            .library
            .relative_path(&template.template_id)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let job = self
            .scheduler
            .submit(
                JobKind::CustomScan,
                JobPayload::CustomScan {
                    target: target.as_str().to_string(),
                    template_path: template_path.display().to_string(),
                },
                SubmitOptions::default(),
            )
            .await?;
        Ok(Self::receipt(job))
    }

    /// Scan driven by a natural-language description; the template is
    /// synthesized at execution time.
    pub async fn submit_ai_scan(
        &self,
        target: &str,
        description: &str,
    ) -> Result<SubmitReceipt, CoreError> {
        let target = Target::parse(target).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        if description.trim().is_empty() {
            return Err(CoreError::InvalidInput("scan description is empty".into()));
        }
        let job = self
            .scheduler
            .submit(
                JobKind::AiScan,
                JobPayload::AiScan {
                    target: target.as_str().to_string(),
                    description: description.to_string(),
                },
                SubmitOptions::default(),
            )
            .await?;
        Ok(Self::receipt(job))
    }

    fn receipt(job: Job) -> SubmitReceipt {
        let container_name = job.container_name.clone().unwrap_or_default();
        SubmitReceipt {
            job_id: job.id,
            container_name,
        }
    }

    /// Stream a scan's log by container name, resuming from a byte
    /// offset. The channel closes once the job is terminal and the log
    /// is drained.
    pub async fn stream_scan_log(
        &self,
        container_name: &str,
        from_offset: u64,
    ) -> Result<mpsc::Receiver<Vec<u8>>, CoreError> {
        let job = self.registry.find_by_container(container_name).await?;
        let (tx, rx) = mpsc::channel(64);
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut offset = from_offset;
            loop {
                let (bytes, next) = match registry.read_log(&job.id, offset).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Log stream read failed");
                        break;
                    }
                };
                if !bytes.is_empty() {
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                    offset = next;
                    continue;
                }

                match registry.get(&job.id).await {
                    Ok(current) if current.state.is_terminal() => break,
                    Ok(_) => {}
                    Err(_) => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        Ok(rx)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, CoreError> {
        Ok(self.registry.get(job_id).await?)
    }

    /// Cancel a job and its descendants; idempotent.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), CoreError> {
        self.scheduler.cancel(job_id).await
    }

    /// Trigger a pipeline run; idempotent per run id.
    pub async fn trigger_pipeline(&self, run_id: Option<String>) -> Result<String, CoreError> {
        self.pipeline.trigger(TriggerKind::Manual, run_id).await
    }

    /// Pipeline counters, global or for one run.
    pub async fn get_pipeline_metrics(
        &self,
        run_id: Option<&str>,
    ) -> Result<std::collections::HashMap<String, i64>, CoreError> {
        self.pipeline.metrics().snapshot(run_id).await
    }

    /// Validate and store a template; identical bodies yield identical
    /// ids.
    pub async fn upload_template(
        &self,
        body: &[u8],
        filename: &str,
    ) -> Result<String, CoreError> {
        let body = std::str::from_utf8(body)
            .map_err(|_| CoreError::InvalidInput("template body is not UTF-8".into()))?;
        let template = self
            .library
            .store_upload(body, filename)
            .await
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(template.template_id)
    }

    /// Runtime status for a scan container, for pollers that only hold
    /// the container name.
    pub async fn get_container_status(
        &self,
        container_name: &str,
    ) -> Result<ContainerStatus, CoreError> {
        let job = self.registry.find_by_container(container_name).await?;
        let state = self
            .runner
            .container_state(container_name)
            .await
            .map_err(CoreError::from)?;
        let state = match state {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited(_) => "exited",
            ContainerState::Missing => "missing",
        };
        Ok(ContainerStatus {
            container_name: container_name.to_string(),
            state: state.to_string(),
            job_state: job.state.to_string(),
            job_id: job.id,
        })
    }
}
