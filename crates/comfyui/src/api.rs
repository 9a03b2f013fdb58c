//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! queue inspection, system stats) using [`reqwest`].

use std::time::Duration;

use crate::messages::{parse_history, parse_queue, HistoryRecord, RemoteQueue, SubmitResponse};

/// Timeout for read-only status requests.
const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for `/prompt` submissions, which validate the whole graph.
const SUBMIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The body was JSON but not the expected shape.
    #[error("Unexpected response shape: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the history record for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. Returns `None` while the
    /// prompt has not finished.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryRecord>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(STATUS_REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_history(prompt_id, &body)?)
    }

    /// Snapshot of the running and pending prompt ids (`GET /queue`).
    pub async fn get_queue(&self) -> Result<RemoteQueue, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .timeout(STATUS_REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_queue(body)?)
    }

    /// Raw `GET /system_stats` body (devices, VRAM, versions).
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(STATUS_REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Quick liveness probe: `GET /system_stats` answered with 2xx.
    pub async fn ping(&self) -> bool {
        match self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(api_url = %self.api_url, error = %e, "ComfyUI probe failed");
                false
            }
        }
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
