//! The [`Job`] record: one unit of submitted generation work.
//!
//! A job's identity, prompt text and workflow parameters are fixed at
//! construction. Everything else is lifecycle state that the queue and
//! executor update as the job moves through [`JobStatus`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scheduling::{state_machine, DEFAULT_MAX_RETRIES, PRIORITY_NORMAL};
use crate::types::{JobId, RemoteId, Timestamp};

/// Workflow type used when the caller does not pick one.
pub const DEFAULT_WORKFLOW_TYPE: &str = "txt2img";

/// Opaque key/value parameters passed through to workflow preparation.
pub type WorkflowParams = Map<String, Value>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RetryScheduled,
}

impl JobStatus {
    /// Completed, Failed and Cancelled have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job is waiting in the pending set.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::RetryScheduled)
    }

    /// Whether the queue lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        state_machine::can_transition(self, to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RetryScheduled => "retry_scheduled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a job attempt (or the job as a whole) failed.
///
/// Callers can tell "gave up waiting" ([`FailureReason::Timeout`]) apart
/// from "the remote service said it failed" ([`FailureReason::RemoteFailed`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The workflow payload could not be built from the job parameters.
    #[error("workflow preparation failed: {message}")]
    Preparation { message: String },

    /// The remote service refused the submission.
    #[error("submission rejected: {message}")]
    SubmissionRejected { message: String },

    /// The remote service could not be reached.
    #[error("remote service unreachable: {message}")]
    Transport { message: String },

    /// The remote service reported the execution as failed.
    #[error("remote execution failed: {message}")]
    RemoteFailed { message: String },

    /// No conclusive status before the wait ceiling.
    #[error("timed out after {elapsed_secs:.1}s waiting for completion")]
    Timeout { elapsed_secs: f64 },

    /// The wait was interrupted by a stop/cancel signal.
    #[error("cancelled while waiting for completion")]
    Cancelled,

    /// Every configured attempt failed; `last` is the final attempt's reason.
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<FailureReason>,
    },
}

impl FailureReason {
    /// Short machine-readable tag, e.g. `"timeout"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Preparation { .. } => "preparation",
            Self::SubmissionRejected { .. } => "submission_rejected",
            Self::Transport { .. } => "transport",
            Self::RemoteFailed { .. } => "remote_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::RetryExhausted { .. } => "retry_exhausted",
        }
    }

    /// The innermost reason, unwrapping [`FailureReason::RetryExhausted`].
    pub fn root(&self) -> &FailureReason {
        match self {
            Self::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    prompt: String,
    workflow_type: String,
    workflow_params: WorkflowParams,

    /// Higher is served first.
    pub priority: i32,
    /// Total attempts allowed, including the first.
    pub max_retries: u32,
    /// Attempts started so far.
    pub attempt_count: u32,
    pub status: JobStatus,

    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,

    /// Server-assigned id of the current attempt's submission.
    pub remote_id: Option<RemoteId>,
    pub last_error: Option<FailureReason>,
    /// Wall-clock seconds of the last successful execution.
    pub duration_secs: Option<f64>,
    pub output_files: Vec<String>,
}

impl Job {
    /// Create a pending job with default priority and retry budget.
    pub fn new(id: impl Into<JobId>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            workflow_type: DEFAULT_WORKFLOW_TYPE.to_string(),
            workflow_params: WorkflowParams::new(),
            priority: PRIORITY_NORMAL,
            max_retries: DEFAULT_MAX_RETRIES,
            attempt_count: 0,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            remote_id: None,
            last_error: None,
            duration_secs: None,
            output_files: Vec::new(),
        }
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = workflow_type.into();
        self
    }

    pub fn with_params(mut self, params: WorkflowParams) -> Self {
        self.workflow_params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn workflow_params(&self) -> &WorkflowParams {
        &self.workflow_params
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_retries
    }

    /// Mark the start of a new attempt.
    pub fn begin_attempt(&mut self) {
        self.attempt_count += 1;
        self.status = JobStatus::Running;
        self.started_at = Some(chrono::Utc::now());
        self.completed_at = None;
    }

    /// Clear attempt-local fields before a retry.
    ///
    /// Identity, prompt, parameters and the attempt counter are untouched.
    pub fn reset_attempt_state(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.remote_id = None;
        self.last_error = None;
    }

    /// Seconds between `started_at` and `completed_at`, when both are set.
    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
