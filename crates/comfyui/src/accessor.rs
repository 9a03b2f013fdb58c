//! The remote rendering accessor boundary.
//!
//! The orchestration core only talks to the rendering service through
//! [`RenderAccessor`]. Every call is fallible and possibly slow; callers
//! must not assume low latency.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::messages::{HistoryRecord, RemoteQueue};

/// Errors surfaced by a [`RenderAccessor`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessorError {
    /// The service could not be reached (connection, DNS, timeout).
    #[error("remote service unreachable: {0}")]
    Unreachable(String),

    /// The service answered but refused the request.
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The service answered with a body we could not interpret.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AccessorError {
    /// Whether this is a transport-level failure rather than a refusal.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<ComfyUIApiError> for AccessorError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) if e.is_decode() => Self::Malformed(e.to_string()),
            ComfyUIApiError::Request(e) => Self::Unreachable(e.to_string()),
            ComfyUIApiError::ApiError { status, body } => Self::Rejected { status, body },
            ComfyUIApiError::Parse(e) => Self::Malformed(e.to_string()),
        }
    }
}

/// Capability to submit work to, and inspect, a remote rendering service.
#[async_trait]
pub trait RenderAccessor: Send + Sync {
    /// Whether the service currently answers health probes.
    async fn is_reachable(&self) -> bool;

    /// Submit a workflow payload; returns the server-assigned id.
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, AccessorError>;

    /// History record for `remote_id`, `None` while it has not finished.
    async fn get_history(&self, remote_id: &str) -> Result<Option<HistoryRecord>, AccessorError>;

    /// Ids currently running and pending on the service.
    async fn get_queue_snapshot(&self) -> Result<RemoteQueue, AccessorError>;
}

#[async_trait]
impl RenderAccessor for ComfyUIApi {
    async fn is_reachable(&self) -> bool {
        self.ping().await
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, AccessorError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self.submit_workflow(workflow, &client_id).await?;
        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow queued on ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn get_history(&self, remote_id: &str) -> Result<Option<HistoryRecord>, AccessorError> {
        Ok(ComfyUIApi::get_history(self, remote_id).await?)
    }

    async fn get_queue_snapshot(&self) -> Result<RemoteQueue, AccessorError> {
        Ok(self.get_queue().await?)
    }
}
