use genqueue_core::error::CoreError;
use genqueue_core::job::JobStatus;
use genqueue_core::types::JobId;

/// Errors returned by [`JobQueue`](crate::queue::JobQueue) operations.
///
/// None of these are fatal: the queue is left unchanged whenever one is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The id cannot be used in output filenames.
    #[error(transparent)]
    InvalidId(#[from] CoreError),

    #[error("Job id already queued: {0}")]
    DuplicateId(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// `complete` was called for a job that is not in the running set.
    #[error("Job {id} is not running (status: {status})")]
    NotRunning { id: JobId, status: JobStatus },

    #[error("Job {id} already finished as {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
}

/// Errors surfaced by the orchestrator and pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The rendering service failed its health probe.
    #[error("Rendering service unreachable: {0}")]
    Unreachable(String),

    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("No pending jobs to process")]
    EmptyQueue,

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
