//! ComfyUI REST response types and parsers.
//!
//! The `/history/{prompt_id}` endpoint returns `{}` until the prompt has
//! finished, then `{"<prompt_id>": {"outputs": ..., "status": ...}}`. The
//! `/queue` endpoint returns `queue_running` / `queue_pending` arrays whose
//! items are positional tuples `[number, prompt_id, prompt, extra, outputs]`.

use serde::{Deserialize, Serialize};

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Execution status block inside a history record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
}

/// A finished prompt's history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Raw per-node output data (images, filenames, etc.).
    #[serde(default)]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

impl HistoryRecord {
    /// Whether the server recorded this execution as an error.
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_str == "error")
    }

    /// Filenames of all images listed in the node outputs.
    pub fn output_filenames(&self) -> Vec<String> {
        let Some(nodes) = self.outputs.as_object() else {
            return Vec::new();
        };
        nodes
            .values()
            .filter_map(|node| node.get("images").and_then(|v| v.as_array()))
            .flatten()
            .filter_map(|image| image.get("filename").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }
}

/// Extract the record for `prompt_id` from a `/history/{prompt_id}` body.
///
/// Returns `Ok(None)` when the prompt is not (yet) in the history.
pub fn parse_history(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<Option<HistoryRecord>, serde_json::Error> {
    match body.get(prompt_id) {
        Some(entry) => serde_json::from_value(entry.clone()).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Where a prompt sits in the remote queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    /// Zero-based position among pending prompts.
    Pending(usize),
    NotQueued,
}

/// Prompt ids currently running and pending on the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQueue {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl RemoteQueue {
    pub fn position(&self, prompt_id: &str) -> QueuePosition {
        if self.running.iter().any(|id| id == prompt_id) {
            return QueuePosition::Running;
        }
        match self.pending.iter().position(|id| id == prompt_id) {
            Some(i) => QueuePosition::Pending(i),
            None => QueuePosition::NotQueued,
        }
    }
}

/// Raw `/queue` response shape.
#[derive(Debug, Deserialize)]
struct RawQueue {
    #[serde(default)]
    queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<serde_json::Value>>,
}

/// Parse a `/queue` body into prompt id lists.
///
/// Items shorter than two elements or without a string id are skipped.
pub fn parse_queue(body: serde_json::Value) -> Result<RemoteQueue, serde_json::Error> {
    let raw: RawQueue = serde_json::from_value(body)?;
    let ids = |items: Vec<Vec<serde_json::Value>>| {
        items
            .into_iter()
            .filter_map(|item| item.get(1).and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    };
    Ok(RemoteQueue {
        running: ids(raw.queue_running),
        pending: ids(raw.queue_pending),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- history --

    #[test]
    fn history_absent_is_none() {
        let record = parse_history("abc", &json!({})).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn history_success_record() {
        let body = json!({
            "abc": {
                "outputs": {
                    "9": {"images": [
                        {"filename": "job-1_00001_.png", "subfolder": "", "type": "output"},
                        {"filename": "job-1_00002_.png", "subfolder": "", "type": "output"}
                    ]}
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let record = parse_history("abc", &body).unwrap().unwrap();
        assert!(!record.is_error());
        assert_eq!(
            record.output_filenames(),
            vec!["job-1_00001_.png", "job-1_00002_.png"]
        );
    }

    #[test]
    fn history_error_record() {
        let body = json!({"abc": {"outputs": {}, "status": {"status_str": "error", "completed": false}}});
        let record = parse_history("abc", &body).unwrap().unwrap();
        assert!(record.is_error());
        assert!(record.output_filenames().is_empty());
    }

    #[test]
    fn history_without_status_block() {
        let body = json!({"abc": {"outputs": {}}});
        let record = parse_history("abc", &body).unwrap().unwrap();
        assert!(!record.is_error());
    }

    // -- queue --

    #[test]
    fn queue_positions() {
        let body = json!({
            "queue_running": [[7, "run-1", {}, {}, []]],
            "queue_pending": [[8, "pend-1", {}, {}, []], [9, "pend-2", {}, {}, []]]
        });
        let queue = parse_queue(body).unwrap();
        assert_eq!(queue.position("run-1"), QueuePosition::Running);
        assert_eq!(queue.position("pend-2"), QueuePosition::Pending(1));
        assert_eq!(queue.position("gone"), QueuePosition::NotQueued);
    }

    #[test]
    fn queue_skips_malformed_items() {
        let body = json!({"queue_running": [[1]], "queue_pending": [[2, 3]]});
        let queue = parse_queue(body).unwrap();
        assert!(queue.running.is_empty());
        assert!(queue.pending.is_empty());
    }

    #[test]
    fn queue_missing_keys_is_empty() {
        let queue = parse_queue(json!({})).unwrap();
        assert_eq!(queue, RemoteQueue::default());
    }
}
