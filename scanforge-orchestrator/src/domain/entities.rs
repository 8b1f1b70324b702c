//! Job entities and payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scanforge_core::CoreError;
use scanforge_runner::TemplateSelector;

use super::state::JobState;

/// Opaque, URL-safe job identifier.
pub type JobId = String;

/// Mint a fresh job id (hyphen-free UUID).
pub fn new_job_id() -> JobId {
    Uuid::new_v4().simple().to_string()
}

/// What kind of work a job performs. Handlers are registered by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    CustomScan,
    AiScan,
    FetchCves,
    GenerateTemplate,
    StoreTemplates,
    ValidateTemplate,
    RefineTemplate,
    PipelineRoot,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::CustomScan => "custom_scan",
            JobKind::AiScan => "ai_scan",
            JobKind::FetchCves => "fetch_cves",
            JobKind::GenerateTemplate => "generate_template",
            JobKind::StoreTemplates => "store_templates",
            JobKind::ValidateTemplate => "validate_template",
            JobKind::RefineTemplate => "refine_template",
            JobKind::PipelineRoot => "pipeline_root",
        }
    }

    /// Default retry budget per kind. Validation is deliberately 1: the
    /// refinement loop owns its retries.
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            JobKind::Scan | JobKind::CustomScan | JobKind::AiScan => 1,
            JobKind::FetchCves => 3,
            JobKind::GenerateTemplate => 3,
            JobKind::StoreTemplates => 1,
            JobKind::ValidateTemplate => 1,
            JobKind::RefineTemplate => 3,
            JobKind::PipelineRoot => 1,
        }
    }

    /// Whether jobs of this kind run a scan container.
    pub fn is_scan(&self) -> bool {
        matches!(self, JobKind::Scan | JobKind::CustomScan | JobKind::AiScan)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task-specific payload, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Scan {
        target: String,
        selector: TemplateSelector,
    },
    CustomScan {
        target: String,
        /// Template path relative to the library root.
        template_path: String,
    },
    AiScan {
        target: String,
        description: String,
    },
    FetchCves {
        window_days: i64,
    },
    GenerateTemplate {
        cve_id: String,
        description: String,
        run_id: String,
    },
    StoreTemplates {
        run_id: String,
    },
    ValidateTemplate {
        template_id: String,
        cve_id: String,
        /// Template path relative to the library root.
        template_path: String,
        attempt: u32,
        run_id: String,
    },
    RefineTemplate {
        cve_id: String,
        template_id: String,
        template_path: String,
        failure: String,
        refinement: u32,
        run_id: String,
    },
    PipelineRoot {
        run_id: String,
    },
}

/// A tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parent_id: Option<JobId>,
    /// 1-indexed attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: JobPayload,
    /// Chain input: the result of the preceding stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
    /// Only populated for scan-kind jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Backoff deadline while in `Retrying`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: JobKind, payload: JobPayload, parent_id: Option<JobId>) -> Self {
        Self {
            id: new_job_id(),
            kind,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            parent_id,
            attempt: 1,
            max_attempts: kind.default_max_attempts(),
            payload,
            input: None,
            result: None,
            error: None,
            container_name: None,
            worker_id: None,
            retry_at: None,
        }
    }
}

/// How a scan run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalEvent {
    Completed,
    NoResults,
    LoopDetected,
    Timeout,
    RuntimeError,
}

/// Result of a scan-kind job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub exit_code: i64,
    pub findings_count: u64,
    pub terminal_event: TerminalEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_url_safe_and_unique() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn new_jobs_start_queued_on_first_attempt() {
        let job = Job::new(
            JobKind::Scan,
            JobPayload::Scan {
                target: "example.com".into(),
                selector: TemplateSelector::All,
            },
            None,
        );
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.max_attempts, 1);
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn retry_budgets_follow_kind() {
        assert_eq!(JobKind::Scan.default_max_attempts(), 1);
        assert_eq!(JobKind::GenerateTemplate.default_max_attempts(), 3);
        assert_eq!(JobKind::ValidateTemplate.default_max_attempts(), 1);
        assert_eq!(JobKind::RefineTemplate.default_max_attempts(), 3);
    }

    #[test]
    fn payload_round_trips_with_kind_tag() {
        let payload = JobPayload::GenerateTemplate {
            cve_id: "CVE-2024-0001".into(),
            description: "desc".into(),
            run_id: "run1".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("generate_template"));
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, JobPayload::GenerateTemplate { .. }));
    }
}
