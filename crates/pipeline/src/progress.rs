//! Progress aggregation: lifecycle events and queue counters in, telemetry out.
//!
//! The aggregator keeps three bounded buffers (snapshot history, event log,
//! rolling window of finished-job durations) and notifies observers
//! synchronously on every [`ProgressAggregator::update_progress`]. A
//! panicking observer is logged and skipped; the others still run.
//!
//! Snapshot timestamps never go backwards and completed/failed counts
//! never decrease within a session. Counts are per session: jobs the queue
//! had already finished when the session opened are not included.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use genqueue_core::job::FailureReason;
use genqueue_core::job_events::{ProgressEvent, ProgressEventKind};
use genqueue_core::progress::{
    average_secs, estimate_remaining_secs, progress_percent, success_rate, throughput_per_minute,
    ProgressSnapshot, QueueSnapshot,
};
use genqueue_core::types::{JobId, Timestamp};

use crate::config::ProgressConfig;

/// Snapshots considered by [`ProgressAggregator::performance_metrics`].
const METRICS_WINDOW: usize = 10;

/// A progress subscriber.
pub type Observer = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Handle returned by [`ProgressAggregator::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub is_active: bool,
    /// Job count announced by `start`.
    pub total_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub progress_percent: f64,
    pub success_rate: f64,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: f64,
    pub current_job_id: Option<JobId>,
    pub current_job_fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub average_throughput_per_minute: f64,
    pub peak_throughput_per_minute: f64,
    pub min_job_secs: Option<f64>,
    pub max_job_secs: Option<f64>,
    pub average_job_secs: f64,
    /// Durations in the rolling window.
    pub samples: usize,
}

/// Serializable dump of one session.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressExport {
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub summary: ProgressSummary,
    pub snapshots: Vec<ProgressSnapshot>,
    pub events: Vec<ProgressEvent>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct ProgressAggregator {
    config: ProgressConfig,
    total_jobs: usize,
    session_start: Option<Instant>,
    started_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
    job_starts: HashMap<JobId, Instant>,
    durations: VecDeque<f64>,
    snapshots: VecDeque<ProgressSnapshot>,
    events: VecDeque<ProgressEvent>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    // Queue counts when the session opened.
    baseline_completed: usize,
    baseline_failed: usize,
    // Floors that keep counts non-decreasing within a session.
    completed_floor: usize,
    failed_floor: usize,
}

impl ProgressAggregator {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            total_jobs: 0,
            session_start: None,
            started_at: None,
            ended_at: None,
            job_starts: HashMap::new(),
            durations: VecDeque::new(),
            snapshots: VecDeque::new(),
            events: VecDeque::new(),
            observers: Vec::new(),
            next_observer: 0,
            baseline_completed: 0,
            baseline_failed: 0,
            completed_floor: 0,
            failed_floor: 0,
        }
    }

    /// Whether a session is open (started and not stopped).
    pub fn is_active(&self) -> bool {
        self.session_start.is_some() && self.ended_at.is_none()
    }

    /// Open a monitoring session for `total_jobs` jobs on a fresh queue.
    pub fn start(&mut self, total_jobs: usize) {
        self.start_with_baseline(total_jobs, QueueSnapshot::default());
    }

    /// Open a session on a queue that may already hold finished jobs.
    ///
    /// The completed and failed counts in `baseline` are subtracted from
    /// every later queue snapshot.
    pub fn start_with_baseline(&mut self, total_jobs: usize, baseline: QueueSnapshot) {
        self.total_jobs = total_jobs;
        self.baseline_completed = baseline.completed;
        self.baseline_failed = baseline.failed;
        self.session_start = Some(Instant::now());
        self.started_at = Some(chrono::Utc::now());
        self.ended_at = None;
        self.job_starts.clear();
        self.completed_floor = 0;
        self.failed_floor = 0;

        tracing::info!(total_jobs, "Progress session started");
        self.push_event(
            ProgressEvent::new(ProgressEventKind::BatchStarted, format!("Batch of {total_jobs} jobs started"))
                .with_details(serde_json::json!({ "total_jobs": total_jobs })),
        );
    }

    /// Close the session.
    pub fn stop(&mut self) {
        if !self.is_active() {
            return;
        }
        self.ended_at = Some(chrono::Utc::now());
        let elapsed_secs = self.elapsed().as_secs_f64();

        tracing::info!(
            completed = self.completed_floor,
            failed = self.failed_floor,
            elapsed_secs,
            "Progress session stopped",
        );
        self.push_event(
            ProgressEvent::new(ProgressEventKind::BatchCompleted, "Batch finished").with_details(
                serde_json::json!({
                    "completed": self.completed_floor,
                    "failed": self.failed_floor,
                    "elapsed_secs": elapsed_secs,
                }),
            ),
        );
    }

    pub fn record_started(&mut self, job_id: &str) {
        self.job_starts.insert(job_id.to_string(), Instant::now());
        self.push_event(ProgressEvent::new(ProgressEventKind::JobStarted, "Job started").with_job(job_id));
    }

    /// Record a success and add its duration to the rolling window.
    pub fn record_completed(&mut self, job_id: &str) {
        let duration_secs = self
            .job_starts
            .remove(job_id)
            .map(|start| start.elapsed().as_secs_f64());

        if let Some(secs) = duration_secs {
            self.durations.push_back(secs);
            while self.durations.len() > self.config.duration_window_cap {
                self.durations.pop_front();
            }
        }

        self.push_event(
            ProgressEvent::new(ProgressEventKind::JobCompleted, "Job completed")
                .with_job(job_id)
                .with_details(serde_json::json!({ "duration_secs": duration_secs })),
        );
    }

    pub fn record_failed(&mut self, job_id: &str, reason: &FailureReason) {
        self.job_starts.remove(job_id);
        self.push_event(
            ProgressEvent::new(ProgressEventKind::JobFailed, reason.to_string())
                .with_job(job_id)
                .with_details(serde_json::json!({ "reason": reason.kind() })),
        );
    }

    /// Build a snapshot from the queue counters, store it and notify
    /// observers.
    pub fn update_progress(
        &mut self,
        queue: QueueSnapshot,
        current_job_id: Option<&str>,
        current_job_fraction: Option<f64>,
    ) -> ProgressSnapshot {
        let previous = self.snapshots.back();

        let mut timestamp = chrono::Utc::now();
        if let Some(prev) = previous {
            timestamp = timestamp.max(prev.timestamp);
        }

        let session_completed = queue.completed.saturating_sub(self.baseline_completed);
        let session_failed = queue.failed.saturating_sub(self.baseline_failed);
        self.completed_floor = self.completed_floor.max(session_completed);
        self.failed_floor = self.failed_floor.max(session_failed);
        let completed = self.completed_floor;
        let failed = self.failed_floor;

        let average_secs_per_job = average_secs(&self.durations);
        let remaining = queue.remaining();

        let snapshot = ProgressSnapshot {
            timestamp,
            total: remaining + completed + failed,
            pending: queue.pending,
            running: queue.running,
            completed,
            failed,
            success_rate: success_rate(completed, failed),
            average_secs_per_job,
            throughput_per_minute: throughput_per_minute(completed, self.elapsed()),
            estimated_remaining_secs: estimate_remaining_secs(remaining, average_secs_per_job),
            current_job_id: current_job_id.map(str::to_string),
            current_job_fraction: current_job_fraction.map(|f| f.clamp(0.0, 1.0)),
        };

        self.snapshots.push_back(snapshot.clone());
        while self.snapshots.len() > self.config.snapshot_history_cap {
            self.snapshots.pop_front();
        }

        self.notify(&snapshot);
        snapshot
    }

    // ---- observers ----

    pub fn add_observer(&mut self, observer: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    // ---- queries ----

    pub fn latest_snapshot(&self) -> Option<ProgressSnapshot> {
        self.snapshots.back().cloned()
    }

    /// Snapshots with `from <= timestamp <= to`, oldest first.
    pub fn snapshots_between(&self, from: Timestamp, to: Timestamp) -> Vec<ProgressSnapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect()
    }

    /// The last `n` events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<ProgressEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn events_of_kind(&self, kind: ProgressEventKind) -> Vec<ProgressEvent> {
        self.events.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn summary(&self) -> ProgressSummary {
        let latest = self.snapshots.back();
        let completed = self.completed_floor;
        let failed = self.failed_floor;
        let total = latest.map_or(self.total_jobs, |s| s.total);

        ProgressSummary {
            is_active: self.is_active(),
            total_jobs: self.total_jobs,
            completed,
            failed,
            pending: latest.map_or(0, |s| s.pending),
            running: latest.map_or(0, |s| s.running),
            progress_percent: progress_percent(completed + failed, total),
            success_rate: success_rate(completed, failed),
            elapsed_secs: self.elapsed().as_secs_f64(),
            estimated_remaining_secs: latest.map_or(0.0, |s| s.estimated_remaining_secs),
            current_job_id: latest.and_then(|s| s.current_job_id.clone()),
            current_job_fraction: latest.and_then(|s| s.current_job_fraction),
        }
    }

    /// Throughput over the last few snapshots and job-duration extremes.
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let skip = self.snapshots.len().saturating_sub(METRICS_WINDOW);
        let recent: Vec<f64> = self
            .snapshots
            .iter()
            .skip(skip)
            .map(|s| s.throughput_per_minute)
            .collect();

        PerformanceMetrics {
            average_throughput_per_minute: average_secs(&recent),
            peak_throughput_per_minute: recent.iter().copied().fold(0.0, f64::max),
            min_job_secs: self.durations.iter().copied().reduce(f64::min),
            max_job_secs: self.durations.iter().copied().reduce(f64::max),
            average_job_secs: average_secs(&self.durations),
            samples: self.durations.len(),
        }
    }

    pub fn export(&self) -> ProgressExport {
        ProgressExport {
            started_at: self.started_at,
            ended_at: self.ended_at,
            summary: self.summary(),
            snapshots: self.snapshots.iter().cloned().collect(),
            events: self.events.iter().cloned().collect(),
        }
    }

    /// Drop all but the `keep_recent` newest snapshots and events.
    pub fn clear_history(&mut self, keep_recent: usize) {
        while self.snapshots.len() > keep_recent {
            self.snapshots.pop_front();
        }
        while self.events.len() > keep_recent {
            self.events.pop_front();
        }
    }

    // ---- private helpers ----

    fn elapsed(&self) -> Duration {
        self.session_start.map_or(Duration::ZERO, |start| start.elapsed())
    }

    fn push_event(&mut self, event: ProgressEvent) {
        self.events.push_back(event);
        while self.events.len() > self.config.event_log_cap {
            self.events.pop_front();
        }
    }

    fn notify(&self, snapshot: &ProgressSnapshot) {
        for (id, observer) in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
                tracing::error!(observer = id.0, "Progress observer panicked");
            }
        }
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(ProgressConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Logging observer
// ---------------------------------------------------------------------------

/// Observer that logs one progress line at most every `min_interval`, plus
/// the snapshot where no work remains.
pub fn logging_observer(min_interval: Duration) -> impl Fn(&ProgressSnapshot) + Send + Sync + 'static {
    let limiter = RateLimiter::new(min_interval);
    move |snapshot: &ProgressSnapshot| {
        let finished = snapshot.pending + snapshot.running == 0;
        if !limiter.ready(Instant::now()) && !finished {
            return;
        }
        tracing::info!(
            completed = snapshot.completed,
            failed = snapshot.failed,
            total = snapshot.total,
            percent = snapshot.progress_percent(),
            throughput_per_minute = snapshot.throughput_per_minute,
            eta_secs = snapshot.estimated_remaining_secs.round() as u64,
            current_job = snapshot.current_job_id.as_deref().unwrap_or("-"),
            "Progress",
        );
    }
}

struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Whether enough time has passed since the last `true`.
    fn ready(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
