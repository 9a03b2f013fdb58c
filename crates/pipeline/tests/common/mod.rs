//! Shared fixtures for the pipeline integration tests.
//!
//! [`FakeService`] is a scripted in-memory rendering service. Each prompt
//! can be given a list of [`Script`] steps, consumed one per submission
//! (the last step repeats). Prompts without a script succeed.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use genqueue_comfyui::accessor::{AccessorError, RenderAccessor};
use genqueue_comfyui::messages::{HistoryRecord, HistoryStatus, RemoteQueue};
use genqueue_pipeline::config::OrchestratorConfig;

/// What the fake service does with one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Finishes at once with a success record.
    Succeed,
    /// Finishes at once with an error record.
    Fail,
    /// Refused at submit time.
    Reject,
    /// The submit request times out although the health probe answers.
    Lose,
    /// Stays in the running queue forever, never reaches the history.
    Hang,
    /// Accepted, then never seen again in either queue or history.
    Vanish,
}

#[derive(Default)]
pub struct FakeService {
    reachable: AtomicBool,
    next_id: AtomicU32,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    outcomes: Mutex<HashMap<String, Script>>,
    submitted: Mutex<Vec<String>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        let service = Self::default();
        service.reachable.store(true, Ordering::SeqCst);
        Arc::new(service)
    }

    /// Script the submissions of `prompt`, in order.
    pub fn script(&self, prompt: &str, steps: &[Script]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), steps.iter().copied().collect());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Prompts in submission order, one entry per accepted submission.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submissions_of(&self, prompt: &str) -> usize {
        self.submitted().iter().filter(|p| *p == prompt).count()
    }

    fn next_step(&self, prompt: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(prompt) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(Script::Succeed),
            Some(steps) => steps.front().copied().unwrap_or(Script::Succeed),
            None => Script::Succeed,
        }
    }

    fn record(status: &str) -> HistoryRecord {
        HistoryRecord {
            outputs: serde_json::json!({
                "9": {"images": [{"filename": "out_00001_.png"}]}
            }),
            status: Some(HistoryStatus {
                status_str: status.to_string(),
                completed: true,
            }),
        }
    }
}

#[async_trait]
impl RenderAccessor for FakeService {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, AccessorError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AccessorError::Unreachable("connection refused".into()));
        }
        let prompt = workflow
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let step = self.next_step(&prompt);
        match step {
            Script::Reject => {
                return Err(AccessorError::Rejected {
                    status: 400,
                    body: "invalid workflow".into(),
                });
            }
            Script::Lose => return Err(AccessorError::Unreachable("request timed out".into())),
            _ => {}
        }

        let remote_id = format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.outcomes.lock().unwrap().insert(remote_id.clone(), step);
        self.submitted.lock().unwrap().push(prompt);
        Ok(remote_id)
    }

    async fn get_history(&self, remote_id: &str) -> Result<Option<HistoryRecord>, AccessorError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AccessorError::Unreachable("connection refused".into()));
        }
        let outcome = self.outcomes.lock().unwrap().get(remote_id).copied();
        Ok(match outcome {
            Some(Script::Succeed) => Some(Self::record("success")),
            Some(Script::Fail) => Some(Self::record("error")),
            _ => None,
        })
    }

    async fn get_queue_snapshot(&self) -> Result<RemoteQueue, AccessorError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AccessorError::Unreachable("connection refused".into()));
        }
        let running = self
            .outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, step)| **step == Script::Hang)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(RemoteQueue {
            running,
            pending: Vec::new(),
        })
    }
}

/// Orchestrator settings with short delays, for paused-clock tests.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.executor.batch_delay = Duration::from_millis(100);
    config.executor.job_timeout = Duration::from_secs(60);
    config.stop_timeout = Duration::from_secs(5);
    config
}
