//! Status reconciliation: turning several unreliable opinions into one status.
//!
//! Each detector reports a [`DetectorOpinion`] per poll tick. [`reconcile`]
//! combines them with confidence-gated priority rules (not averaging), and
//! [`PollSchedule::interval`] decides how long to wait before the next tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Confidence thresholds
// ---------------------------------------------------------------------------

/// A `Completed` opinion must be strictly above this to end polling.
pub const TERMINAL_CONFIDENCE: f64 = 0.8;

/// A `Running` opinion must be strictly above this to count as running.
pub const RUNNING_CONFIDENCE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Opinions
// ---------------------------------------------------------------------------

/// A status as seen from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Completed,
    Failed,
    Running,
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One detector's guess about one job, produced fresh on every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorOpinion {
    /// Name of the detector that produced this opinion.
    pub source: &'static str,
    pub status: RemoteStatus,
    /// In `0.0..=1.0`.
    pub confidence: f64,
    /// Free-form diagnostic detail, e.g. queue position or an error message.
    pub detail: String,
}

impl DetectorOpinion {
    pub fn new(
        source: &'static str,
        status: RemoteStatus,
        confidence: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            confidence: confidence.clamp(0.0, 1.0),
            detail: detail.into(),
        }
    }

    /// Zero-confidence `Unknown`, used when a detector errored.
    pub fn unknown(source: &'static str, detail: impl Into<String>) -> Self {
        Self::new(source, RemoteStatus::Unknown, 0.0, detail)
    }
}

/// Aggregate all opinions gathered in one tick.
///
/// Rules are evaluated in order; the first that matches wins:
/// 1. any `Completed` above [`TERMINAL_CONFIDENCE`] -> `Completed`
/// 2. any `Failed` above [`TERMINAL_CONFIDENCE`] -> `Failed`
/// 3. any `Running` above [`RUNNING_CONFIDENCE`] -> `Running`
/// 4. otherwise `Unknown`
///
/// Rule order decides, not confidence magnitude: `[Completed@0.9,
/// Running@0.95]` is `Completed`.
pub fn reconcile(opinions: &[DetectorOpinion]) -> RemoteStatus {
    let any = |status: RemoteStatus, threshold: f64| {
        opinions
            .iter()
            .any(|o| o.status == status && o.confidence > threshold)
    };

    if any(RemoteStatus::Completed, TERMINAL_CONFIDENCE) {
        RemoteStatus::Completed
    } else if any(RemoteStatus::Failed, TERMINAL_CONFIDENCE) {
        RemoteStatus::Failed
    } else if any(RemoteStatus::Running, RUNNING_CONFIDENCE) {
        RemoteStatus::Running
    } else {
        RemoteStatus::Unknown
    }
}

// ---------------------------------------------------------------------------
// Poll interval
// ---------------------------------------------------------------------------

/// Tunable parameters for the dynamic poll interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSchedule {
    /// Interval with no penalties applied.
    pub base: Duration,
    /// Lower clamp.
    pub min: Duration,
    /// Upper clamp.
    pub max: Duration,
    /// Added once per consecutive `Unknown` tick.
    pub unknown_penalty: Duration,
    /// Jobs older than this are polled less aggressively.
    pub slow_job_after: Duration,
    /// Cap on the elapsed-time term (one second per elapsed minute).
    pub max_elapsed_penalty: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            min: Duration::from_secs(1),
            max: Duration::from_secs(10),
            unknown_penalty: Duration::from_millis(500),
            slow_job_after: Duration::from_secs(120),
            max_elapsed_penalty: Duration::from_secs(5),
        }
    }
}

impl PollSchedule {
    /// Interval before the next tick.
    ///
    /// `base + consecutive_unknowns * unknown_penalty`, plus
    /// `min(elapsed_minutes, max_elapsed_penalty)` seconds once the job is
    /// older than `slow_job_after`, clamped to `[min, max]`.
    pub fn interval(&self, elapsed: Duration, consecutive_unknowns: u32) -> Duration {
        let mut interval = self.base + self.unknown_penalty * consecutive_unknowns;

        if elapsed > self.slow_job_after {
            let elapsed_term = Duration::from_secs_f64(elapsed.as_secs_f64() / 60.0);
            interval += elapsed_term.min(self.max_elapsed_penalty);
        }

        interval.clamp(self.min, self.max.max(self.min))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn op(status: RemoteStatus, confidence: f64) -> DetectorOpinion {
        DetectorOpinion::new("test", status, confidence, "")
    }

    // -- reconcile --

    #[test]
    fn empty_opinions_are_unknown() {
        assert_eq!(reconcile(&[]), RemoteStatus::Unknown);
    }

    #[test]
    fn rule_order_beats_confidence() {
        let opinions = [
            op(RemoteStatus::Completed, 0.9),
            op(RemoteStatus::Running, 0.95),
        ];
        assert_eq!(reconcile(&opinions), RemoteStatus::Completed);
    }

    #[test]
    fn all_unknown_stays_unknown() {
        let opinions = [op(RemoteStatus::Unknown, 0.5), op(RemoteStatus::Unknown, 0.3)];
        assert_eq!(reconcile(&opinions), RemoteStatus::Unknown);
    }

    #[test]
    fn completed_at_threshold_is_not_enough() {
        let opinions = [op(RemoteStatus::Completed, 0.8)];
        assert_eq!(reconcile(&opinions), RemoteStatus::Unknown);
    }

    #[test]
    fn failed_beats_running() {
        let opinions = [op(RemoteStatus::Running, 0.9), op(RemoteStatus::Failed, 0.95)];
        assert_eq!(reconcile(&opinions), RemoteStatus::Failed);
    }

    #[test]
    fn completed_beats_failed() {
        let opinions = [op(RemoteStatus::Failed, 1.0), op(RemoteStatus::Completed, 0.85)];
        assert_eq!(reconcile(&opinions), RemoteStatus::Completed);
    }

    #[test]
    fn low_confidence_completed_falls_through_to_running() {
        let opinions = [op(RemoteStatus::Completed, 0.7), op(RemoteStatus::Running, 0.8)];
        assert_eq!(reconcile(&opinions), RemoteStatus::Running);
    }

    #[test]
    fn weak_running_is_unknown() {
        assert_eq!(reconcile(&[op(RemoteStatus::Running, 0.5)]), RemoteStatus::Unknown);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(op(RemoteStatus::Running, 7.0).confidence, 1.0);
        assert_eq!(op(RemoteStatus::Running, -1.0).confidence, 0.0);
    }

    // -- PollSchedule::interval --

    #[test]
    fn interval_is_base_for_fresh_job() {
        let s = PollSchedule::default();
        assert_eq!(s.interval(Duration::from_secs(10), 0), Duration::from_secs(2));
    }

    #[test]
    fn interval_grows_with_unknowns() {
        let s = PollSchedule::default();
        assert_eq!(
            s.interval(Duration::from_secs(10), 4),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn interval_grows_for_slow_jobs() {
        let s = PollSchedule::default();
        // 180s elapsed -> +3s
        assert_eq!(
            s.interval(Duration::from_secs(180), 0),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn elapsed_term_is_capped() {
        let s = PollSchedule::default();
        // 30 minutes elapsed -> capped at +5s
        assert_eq!(
            s.interval(Duration::from_secs(1800), 0),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn interval_clamped_to_max() {
        let s = PollSchedule::default();
        assert_eq!(
            s.interval(Duration::from_secs(1800), 40),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn interval_clamped_to_min() {
        let s = PollSchedule {
            base: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(s.interval(Duration::ZERO, 0), Duration::from_secs(1));
    }
}
