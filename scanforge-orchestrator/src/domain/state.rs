//! Job state machine.
//!
//! Transitions are monotonic except the retry edge: a failed attempt
//! moves through `Retrying` back to `Queued`. Terminal states accept no
//! further transitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failure,
    Retrying,
    Cancelled,
}

/// Attempted an illegal state transition.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct JobTransitionError {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Cancelled)
    }

    /// Whether the edge `self -> to` is legal.
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }

    pub fn check_transition(&self, to: JobState) -> Result<(), JobTransitionError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(JobTransitionError { from: *self, to })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Retrying => "retrying",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
