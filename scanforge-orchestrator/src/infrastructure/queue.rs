//! Named task queues on top of the KV store's list primitives.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use scanforge_core::{CoreError, KvStore, KvStoreExt};

use crate::domain::entities::{JobId, JobKind};

/// The named queues. FIFO within a queue; nothing is promised across
/// queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Scans,
    Pipeline,
    Generate,
    Validate,
    Refine,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Scans,
        QueueName::Pipeline,
        QueueName::Generate,
        QueueName::Validate,
        QueueName::Refine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Scans => "scans",
            QueueName::Pipeline => "pipeline",
            QueueName::Generate => "generate",
            QueueName::Validate => "validate",
            QueueName::Refine => "refine",
        }
    }

    fn key(&self) -> String {
        format!("queue:{}", self.as_str())
    }

    /// Which queue a job kind is dispatched on.
    ///
    /// The `pipeline` queue carries only root jobs so its concurrency
    /// limit serializes pipeline runs; the stages a root awaits live on
    /// other queues, otherwise a run would starve its own children.
    pub fn for_kind(kind: JobKind) -> QueueName {
        match kind {
            JobKind::Scan | JobKind::CustomScan | JobKind::AiScan => QueueName::Scans,
            JobKind::PipelineRoot => QueueName::Pipeline,
            JobKind::FetchCves | JobKind::GenerateTemplate | JobKind::StoreTemplates => {
                QueueName::Generate
            }
            JobKind::ValidateTemplate => QueueName::Validate,
            JobKind::RefineTemplate => QueueName::Refine,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message placed on a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub job_id: JobId,
}

/// Handle for one named queue.
#[derive(Clone)]
pub struct TaskQueue {
    kv: Arc<dyn KvStore>,
    name: QueueName,
    soft_cap: u64,
}

impl TaskQueue {
    pub fn new(kv: Arc<dyn KvStore>, name: QueueName, soft_cap: u64) -> Self {
        Self { kv, name, soft_cap }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Enqueue fails fast with `QueueFull` once the soft cap is hit.
    pub async fn enqueue(&self, job_id: &str) -> Result<(), CoreError> {
        let key = self.name.key();
        let pending = self
            .kv
            .llen(&key)
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
        if pending >= self.soft_cap {
            return Err(CoreError::QueueFull(format!(
                "queue {} has {} pending items",
                self.name, pending
            )));
        }
        self.kv
            .lpush_json(
                &key,
                &QueuedTask {
                    job_id: job_id.to_string(),
                },
            )
            .await
            .map_err(|e| {
                error!(queue = %self.name, error = %e, "Failed to enqueue task");
                CoreError::KvUnavailable(e.to_string())
            })
    }

    /// Blocking pop with a timeout; `None` when the queue stayed empty.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedTask>, CoreError> {
        self.kv
            .brpop_json(&self.name.key(), timeout)
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))
    }

    pub async fn pending(&self) -> Result<u64, CoreError> {
        self.kv
            .llen(&self.name.key())
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))
    }
}
