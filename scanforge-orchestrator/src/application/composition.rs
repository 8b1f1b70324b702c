//! Pipeline composition primitives: chains, groups, callbacks.
//!
//! A chain runs stages sequentially, feeding each stage's result into the
//! next as its input; the first failure aborts the rest. A group fans
//! out independent tasks and completes when all of them finish, success
//! or not. Callbacks are ordinary code run on the group's result vector.

use futures::future::join_all;

use scanforge_core::CoreError;

use crate::domain::entities::{JobId, JobKind, JobPayload};

use super::scheduler::{Scheduler, SubmitOptions};

/// A task to be composed into a chain or group.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: JobKind,
    pub payload: JobPayload,
}

impl TaskSpec {
    pub fn new(kind: JobKind, payload: JobPayload) -> Self {
        Self { kind, payload }
    }
}

impl Scheduler {
    /// Submit a task and wait for its terminal state.
    pub async fn run_task(
        &self,
        spec: TaskSpec,
        parent_id: Option<JobId>,
        input: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        let job = self
            .submit(
                spec.kind,
                spec.payload,
                SubmitOptions {
                    parent_id,
                    input,
                    ..SubmitOptions::default()
                },
            )
            .await?;
        self.await_terminal(&job.id).await
    }

    /// `A ▸ B ▸ C`: B starts when A succeeds and receives A's result as
    /// its input. Any failure aborts the chain; the caller (usually the
    /// chain's root job handler) propagates the error to the root.
    pub async fn run_chain(
        &self,
        specs: Vec<TaskSpec>,
        parent_id: Option<JobId>,
    ) -> Result<serde_json::Value, CoreError> {
        let mut carried: Option<serde_json::Value> = None;
        for spec in specs {
            let result = self.run_task(spec, parent_id.clone(), carried.take()).await?;
            carried = Some(result);
        }
        Ok(carried.unwrap_or(serde_json::Value::Null))
    }

    /// Fan out independent tasks; completes when all children finish.
    /// The result vector preserves per-child outcomes in input order.
    pub async fn run_group(
        &self,
        specs: Vec<TaskSpec>,
        parent_id: Option<JobId>,
    ) -> Vec<Result<serde_json::Value, CoreError>> {
        // Submit everything before waiting so the group actually fans out
        let mut submitted = Vec::with_capacity(specs.len());
        for spec in specs {
            let job = self
                .submit(
                    spec.kind,
                    spec.payload,
                    SubmitOptions {
                        parent_id: parent_id.clone(),
                        ..SubmitOptions::default()
                    },
                )
                .await;
            submitted.push(job);
        }

        join_all(submitted.into_iter().map(|job| async move {
            match job {
                Ok(job) => self.await_terminal(&job.id).await,
                Err(e) => Err(e),
            }
        }))
        .await
    }
}
