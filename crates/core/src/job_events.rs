//! Lifecycle events recorded in the progress aggregator's audit log.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// A monitoring session began.
    BatchStarted,
    /// A monitoring session ended.
    BatchCompleted,
    JobStarted,
    JobCompleted,
    JobFailed,
}

impl ProgressEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchStarted => "batch_started",
            Self::BatchCompleted => "batch_completed",
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
        }
    }
}

/// One entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub timestamp: Timestamp,
    pub job_id: Option<JobId>,
    pub message: String,
    /// Free-form JSON payload carrying event-specific data.
    pub details: serde_json::Value,
}

impl ProgressEvent {
    pub fn new(kind: ProgressEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now(),
            job_id: None,
            message: message.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
