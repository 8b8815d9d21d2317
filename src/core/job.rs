//! Processing job lifecycle
//!
//! `Received -> Calibrating -> Validating -> Writing -> Completed`, with
//! `Failed` reachable from every non-terminal state. Transitions go through
//! the named methods only; anything else is an `InvalidTransition`.

use crate::types::{ErrorClass, HsiError, HsiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Received,
    Calibrating,
    Validating,
    Writing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Received, JobState::Calibrating)
                | (JobState::Calibrating, JobState::Validating)
                | (JobState::Validating, JobState::Writing)
                | (JobState::Writing, JobState::Completed)
        ) || (next == JobState::Failed && !self.is_terminal())
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Received => "received",
            JobState::Calibrating => "calibrating",
            JobState::Validating => "validating",
            JobState::Writing => "writing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Structured reason a job ended in `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub class: ErrorClass,
    /// Error kind, e.g. `BandReconciliationError`
    pub kind: String,
    pub message: String,
    /// State the job was in when it failed
    pub failed_in: JobState,
}

impl FailureCause {
    pub fn from_error(error: &HsiError, failed_in: JobState) -> Self {
        Self {
            class: error.class(),
            kind: error.kind_name().to_string(),
            message: error.to_string(),
            failed_in,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} while {}: {}", self.class, self.kind, self.failed_in, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// One dataset moving through the pipeline
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    id: u64,
    dataset_id: String,
    state: JobState,
    history: Vec<StateTransition>,
    cause: Option<FailureCause>,
}

impl ProcessingJob {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            dataset_id: dataset_id.into(),
            state: JobState::Received,
            history: vec![StateTransition {
                state: JobState::Received,
                at: Utc::now(),
            }],
            cause: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        self.cause.as_ref()
    }

    pub fn start_calibrating(&mut self) -> HsiResult<()> {
        self.advance(JobState::Calibrating)
    }

    pub fn start_validating(&mut self) -> HsiResult<()> {
        self.advance(JobState::Validating)
    }

    pub fn start_writing(&mut self) -> HsiResult<()> {
        self.advance(JobState::Writing)
    }

    pub fn complete(&mut self) -> HsiResult<()> {
        self.advance(JobState::Completed)
    }

    /// Move to `Failed`, recording the cause
    pub fn fail(&mut self, error: &HsiError) -> HsiResult<()> {
        let cause = FailureCause::from_error(error, self.state);
        self.advance(JobState::Failed)?;
        log::error!("Job {} ({}) failed: {}", self.id, self.dataset_id, cause);
        self.cause = Some(cause);
        Ok(())
    }

    fn advance(&mut self, next: JobState) -> HsiResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(HsiError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("Job {} ({}): {} -> {}", self.id, self.dataset_id, self.state, next);
        self.state = next;
        self.history.push(StateTransition {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }
}
