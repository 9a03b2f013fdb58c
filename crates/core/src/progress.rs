//! Progress telemetry types and pure throughput/ETA math.
//!
//! [`QueueSnapshot`] is the queue's cheap counter view; [`ProgressSnapshot`]
//! is the full telemetry record the aggregator derives from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// Seconds per minute (60.0).
pub const SECS_PER_MINUTE: f64 = 60.0;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Aggregate counters of the job queue at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs ever enqueued.
    pub total_added: usize,
    /// Completion calls that resolved an attempt (success or failure).
    pub total_processed: usize,
    /// `completed / (completed + failed)`, `0.0` before anything finished.
    pub success_rate: f64,
}

impl QueueSnapshot {
    /// Jobs not yet resolved.
    pub fn remaining(&self) -> usize {
        self.pending + self.running
    }

    /// Jobs that reached Completed or Failed.
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

/// Immutable point-in-time progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub timestamp: Timestamp,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Mean duration over the rolling window of finished jobs.
    pub average_secs_per_job: f64,
    pub throughput_per_minute: f64,
    pub estimated_remaining_secs: f64,
    pub current_job_id: Option<JobId>,
    /// In `0.0..=1.0` when a job is in flight.
    pub current_job_fraction: Option<f64>,
}

impl ProgressSnapshot {
    pub fn progress_percent(&self) -> f64 {
        progress_percent(self.completed + self.failed, self.total)
    }
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

/// Arithmetic mean of `samples` in seconds, `0.0` when empty.
pub fn average_secs<'a>(samples: impl IntoIterator<Item = &'a f64>) -> f64 {
    let (sum, count) = samples
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), s| (sum + s, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Completed jobs per minute since the session started.
///
/// Returns `0.0` when no time has elapsed.
pub fn throughput_per_minute(completed: usize, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / SECS_PER_MINUTE;
    if minutes <= 0.0 {
        0.0
    } else {
        completed as f64 / minutes
    }
}

/// Remaining work in seconds: `remaining * average`.
pub fn estimate_remaining_secs(remaining: usize, average_secs: f64) -> f64 {
    if average_secs <= 0.0 {
        0.0
    } else {
        remaining as f64 * average_secs
    }
}

/// Percentage of `done` over `total`, treating an empty batch as 0 %.
pub fn progress_percent(done: usize, total: usize) -> f64 {
    done as f64 / total.max(1) as f64 * 100.0
}

/// `completed / (completed + failed)`, `0.0` when nothing finished.
pub fn success_rate(completed: usize, failed: usize) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        0.0
    } else {
        completed as f64 / finished as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
