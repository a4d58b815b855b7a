//! Job lifecycle records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

use crate::params::GenerationParams;

pub type JobId = String;

pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Stored lifecycle state. Queue position decides between in-queue and
/// in-progress while an operation is `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Finished,
    Errored,
    Canceled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
        }
    }
}

/// Caller-visible job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NonExistent,
    InQueue,
    InProgress,
    Finished,
    Errored,
    Canceled,
}

impl JobStatus {
    /// Numeric status code used by older clients.
    pub fn code(&self) -> i8 {
        match self {
            Self::NonExistent => -1,
            Self::InQueue => 0,
            Self::InProgress => 1,
            Self::Finished => 2,
            Self::Canceled => 3,
            Self::Errored => 4,
        }
    }
}

/// One image returned by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    /// Base64 PNG exactly as the worker sent it.
    pub data: Arc<str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum JobOutcome {
    #[default]
    Pending,
    Images(Vec<GeneratedImage>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetadata {
    pub state: OperationState,
    /// Unix seconds at submission.
    pub timestamp: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    id: JobId,
    state: OperationState,
    submitted_at: Instant,
    timestamp: i64,
    error: Option<String>,
    params: GenerationParams,
    outcome: JobOutcome,
    worker_id: Option<String>,
    cancel_token: CancellationToken,
}

impl Operation {
    pub fn new(id: JobId, params: GenerationParams) -> Self {
        Self {
            id,
            state: OperationState::Queued,
            submitted_at: Instant::now(),
            timestamp: chrono::Utc::now().timestamp(),
            error: None,
            params,
            outcome: JobOutcome::Pending,
            worker_id: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn assign_worker(&mut self, worker_id: impl Into<String>) {
        self.worker_id = Some(worker_id.into());
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Returns false if the operation had already reached a terminal state.
    pub fn set_finished(&mut self, images: Vec<GeneratedImage>) -> bool {
        self.transition(OperationState::Finished, JobOutcome::Images(images), None)
    }

    pub fn set_errored(&mut self, error: String) -> bool {
        self.transition(
            OperationState::Errored,
            JobOutcome::Error(error.clone()),
            Some(error),
        )
    }

    pub fn set_canceled(&mut self) -> bool {
        let changed = self.transition(OperationState::Canceled, JobOutcome::Pending, None);
        self.cancel_token.cancel();
        changed
    }

    fn transition(
        &mut self,
        state: OperationState,
        outcome: JobOutcome,
        error: Option<String>,
    ) -> bool {
        if self.state.is_terminal() {
            tracing::debug!(
                job_id = %self.id,
                current = self.state.as_str(),
                attempted = state.as_str(),
                "Ignoring write to terminal operation"
            );
            return false;
        }
        self.state = state;
        self.outcome = outcome;
        self.error = error;
        true
    }

    pub fn metadata(&self) -> OperationMetadata {
        OperationMetadata {
            state: self.state,
            timestamp: self.timestamp,
            error: self.error.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(earlier) = self.submitted_at.checked_sub(by) {
            self.submitted_at = earlier;
        }
    }
}
