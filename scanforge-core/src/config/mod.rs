//! Configuration management

pub mod validation;

pub use validation::{Validate, ValidationError};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub kv: KvConfig,
    pub runner: RunnerConfig,
    pub scheduler: SchedulerConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub library: LibraryConfig,
    pub logging: LoggingConfig,
}

/// KV store (Redis-compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Connection URL, e.g. "redis://127.0.0.1:6379"
    pub url: String,
    /// TTL for cached CVE records
    pub cve_ttl_hours: u64,
    /// TTL for persisted job records; 0 disables expiry
    pub job_ttl_hours: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            cve_ttl_hours: 24,
            job_ttl_hours: 0,
        }
    }
}

/// Container runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Scanner image tag
    pub image: String,
    /// Path to the container runtime CLI binary
    pub docker_binary: String,
    /// Network mode for scan containers
    pub network_mode: String,
    /// Pull the scanner image when it is missing locally
    pub pull_on_missing: bool,
    /// Wall-clock budget for a single scan
    pub scan_timeout_seconds: u64,
    /// Grace period before the reaper removes a finished container
    pub destroy_grace_seconds: u64,
    /// Interval between reaper sweeps
    pub reap_interval_seconds: u64,
    /// Poll interval for the log pump
    pub log_poll_millis: u64,
    pub resource_limits: ResourceLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: "projectdiscovery/nuclei:latest".to_string(),
            docker_binary: "docker".to_string(),
            network_mode: "bridge".to_string(),
            pull_on_missing: true,
            scan_timeout_seconds: 30 * 60,
            destroy_grace_seconds: 60,
            reap_interval_seconds: 60,
            log_poll_millis: 500,
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Per-container resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: u64,
    pub pids: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 2.0,
            memory_mb: 1024,
            pids: 256,
        }
    }
}

/// Task scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency per named queue
    pub scans_concurrency: usize,
    pub pipeline_concurrency: usize,
    pub generate_concurrency: usize,
    pub validate_concurrency: usize,
    pub refine_concurrency: usize,
    /// Soft cap on pending items per queue
    pub queue_soft_cap: u64,
    /// Worker liveness heartbeat interval
    pub heartbeat_seconds: u64,
    /// Deadline applied to a single task execution
    pub task_timeout_seconds: u64,
    pub retry: RetryConfigSerializable,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scans_concurrency: 2,
            pipeline_concurrency: 1,
            generate_concurrency: 4,
            validate_concurrency: 2,
            refine_concurrency: 2,
            queue_soft_cap: 1000,
            heartbeat_seconds: 15,
            task_timeout_seconds: 3600,
            retry: RetryConfigSerializable::default(),
        }
    }
}

/// Retry configuration (serializable version)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfigSerializable {
    /// Base delay for exponential backoff (in seconds)
    pub base_seconds: u64,
    /// Delay ceiling (in seconds)
    pub cap_seconds: u64,
}

impl Default for RetryConfigSerializable {
    fn default() -> Self {
        Self {
            base_seconds: 5,
            cap_seconds: 300,
        }
    }
}

impl RetryConfigSerializable {
    /// Convert to the runtime retry policy
    pub fn to_retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            base: Duration::from_secs(self.base_seconds),
            cap: Duration::from_secs(self.cap_seconds),
        }
    }
}

/// LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama-compatible generate endpoint
    pub endpoint: String,
    pub model: String,
    /// Sampling temperature; kept low for reproducible template synthesis
    pub temperature: f64,
    pub timeout_seconds: u64,
    /// Attempts per CVE before a template is skipped
    pub max_generate_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            model: "qwen2.5-coder:14b".to_string(),
            temperature: 0.2,
            timeout_seconds: 300,
            max_generate_attempts: 3,
        }
    }
}

/// Template synthesis pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// CVE feed endpoint (NVD-shaped JSON, date-cursored)
    pub feed_url: String,
    /// Known-vulnerable host used during template validation
    pub reference_target: String,
    /// Refinement budget per template
    pub max_refinements: u32,
    /// Lookback window for the CVE cursor
    pub cve_window_days: i64,
    /// Interval between scheduled pipeline runs; 0 disables the schedule
    pub schedule_interval_hours: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
            reference_target: "honey.scanme.sh".to_string(),
            max_refinements: 3,
            cve_window_days: 7,
            schedule_interval_hours: 0,
        }
    }
}

/// Template library configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root of the template tree; `ai/` and `custom/` live beneath it
    pub root: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/scanforge/templates"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter, overridable via RUST_LOG
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationError> {
        self.kv.validate()?;
        self.runner.validate()?;
        self.scheduler.validate()?;
        if self.llm.timeout_seconds == 0 {
            return Err(ValidationError::new("llm.timeout_seconds must be > 0"));
        }
        if self.llm.max_generate_attempts == 0 {
            return Err(ValidationError::new("llm.max_generate_attempts must be > 0"));
        }
        if self.pipeline.cve_window_days <= 0 {
            return Err(ValidationError::new("pipeline.cve_window_days must be > 0"));
        }
        Ok(())
    }
}

impl Validate for KvConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::new("kv.url must not be empty"));
        }
        if self.cve_ttl_hours == 0 {
            return Err(ValidationError::new("kv.cve_ttl_hours must be > 0"));
        }
        Ok(())
    }
}

impl Validate for RunnerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.image.is_empty() {
            return Err(ValidationError::new("runner.image must not be empty"));
        }
        if self.scan_timeout_seconds == 0 {
            return Err(ValidationError::new("runner.scan_timeout_seconds must be > 0"));
        }
        if self.resource_limits.cpus <= 0.0 {
            return Err(ValidationError::new("runner.resource_limits.cpus must be > 0"));
        }
        Ok(())
    }
}

impl Validate for SchedulerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let concurrencies = [
            self.scans_concurrency,
            self.pipeline_concurrency,
            self.generate_concurrency,
            self.validate_concurrency,
            self.refine_concurrency,
        ];
        if concurrencies.contains(&0) {
            return Err(ValidationError::new("queue concurrency must be > 0"));
        }
        if self.heartbeat_seconds == 0 {
            return Err(ValidationError::new("scheduler.heartbeat_seconds must be > 0"));
        }
        if self.task_timeout_seconds == 0 {
            return Err(ValidationError::new("scheduler.task_timeout_seconds must be > 0"));
        }
        if self.retry.base_seconds == 0 || self.retry.cap_seconds < self.retry.base_seconds {
            return Err(ValidationError::new("scheduler.retry must have 0 < base <= cap"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigLoadError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        // Add environment-specific config if ENV is set
        if let Ok(env) = std::env::var("ENV") {
            builder = builder
                .add_source(config::File::with_name(&format!("config/{}", env)).required(false));
        }

        // Local config and environment variables last (highest priority)
        builder = builder
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("SCANFORGE").separator("__"));

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),
}
