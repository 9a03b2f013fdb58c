//! The status reconciler: polls every detector until a job resolves.
//!
//! One tick queries all enabled, available detectors concurrently and folds
//! their opinions with [`reconcile`]. Between ticks the monitor sleeps for
//! [`PollSchedule::interval`](genqueue_core::reconcile::PollSchedule::interval).
//! A run of `Unknown` ticks triggers a burst of direct history checks
//! (emergency mode) before normal polling resumes.
//!
//! Every sleep and every accessor call races both the caller's
//! [`CancellationToken`] and the wait deadline, so a hung service call
//! cannot hold the wait past its timeout.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use genqueue_comfyui::accessor::RenderAccessor;
use genqueue_core::job::FailureReason;
use genqueue_core::reconcile::{reconcile, DetectorOpinion, RemoteStatus};

use crate::config::MonitorConfig;
use crate::detectors::{default_detectors, DetectionTarget, DetectorStatus, StatusDetector};

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed,
    /// The service reported the execution as failed.
    RemoteFailed { detail: String },
    /// No conclusive answer before the soft or absolute timeout.
    Timeout { elapsed: Duration },
    Cancelled,
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn into_result(self) -> Result<(), FailureReason> {
        match self {
            Self::Completed => Ok(()),
            Self::RemoteFailed { detail } => Err(FailureReason::RemoteFailed { message: detail }),
            Self::Timeout { elapsed } => Err(FailureReason::Timeout {
                elapsed_secs: elapsed.as_secs_f64(),
            }),
            Self::Cancelled => Err(FailureReason::Cancelled),
        }
    }
}

/// Called after every reconciled tick that did not end the wait.
pub type TickCallback = dyn Fn(&DetectionTarget, RemoteStatus) + Send + Sync;

struct DetectorEntry {
    detector: Arc<dyn StatusDetector>,
    enabled: AtomicBool,
}

/// Result of one tick: the reconciled status and the opinion that decided it.
struct TickResult {
    status: RemoteStatus,
    detail: String,
}

/// Watches submitted jobs until they resolve.
pub struct JobMonitor {
    accessor: Arc<dyn RenderAccessor>,
    detectors: Vec<DetectorEntry>,
    config: MonitorConfig,
}

impl JobMonitor {
    pub fn new(
        accessor: Arc<dyn RenderAccessor>,
        detectors: Vec<Arc<dyn StatusDetector>>,
        config: MonitorConfig,
    ) -> Self {
        let detectors = detectors
            .into_iter()
            .map(|detector| DetectorEntry {
                detector,
                enabled: AtomicBool::new(true),
            })
            .collect();
        Self {
            accessor,
            detectors,
            config,
        }
    }

    /// Monitor with the history and queue detectors, plus the file
    /// detector when `output_dir` is set.
    pub fn with_default_detectors(
        accessor: Arc<dyn RenderAccessor>,
        output_dir: Option<std::path::PathBuf>,
        config: MonitorConfig,
    ) -> Self {
        let detectors = default_detectors(Arc::clone(&accessor), output_dir);
        Self::new(accessor, detectors, config)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Enable or disable a detector by name. Returns `false` if no
    /// detector has that name.
    pub fn set_detector_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for entry in self.detectors.iter().filter(|e| e.detector.name() == name) {
            entry.enabled.store(enabled, Ordering::Relaxed);
            found = true;
        }
        found
    }

    /// Name, enabled flag, availability and last error of each detector.
    pub async fn detector_status(&self) -> Vec<DetectorStatus> {
        let mut statuses = Vec::with_capacity(self.detectors.len());
        for entry in &self.detectors {
            statuses.push(DetectorStatus {
                name: entry.detector.name(),
                enabled: entry.enabled.load(Ordering::Relaxed),
                available: entry.detector.is_available().await,
                last_error: entry.detector.last_error(),
            });
        }
        statuses
    }

    /// Poll until the job resolves, a timeout elapses, or `cancel` fires.
    ///
    /// `soft_timeout` is the caller's budget; when it runs out one last
    /// direct history check is made before giving up, bounded by
    /// `final_check_timeout`. The configured absolute timeout ends the wait
    /// unconditionally, even while a service call is still outstanding.
    pub async fn wait_for_completion(
        &self,
        target: &DetectionTarget,
        soft_timeout: Duration,
        cancel: &CancellationToken,
        on_tick: Option<&TickCallback>,
    ) -> WaitOutcome {
        let start = Instant::now();
        let deadline = start + soft_timeout.min(self.config.absolute_timeout);
        let absolute_deadline = start + self.config.absolute_timeout;
        let mut consecutive_unknowns = 0u32;
        let mut last_known: Option<RemoteStatus> = None;

        tracing::info!(
            job_id = %target.job_id,
            remote_id = %target.remote_id,
            soft_timeout_secs = soft_timeout.as_secs(),
            "Monitoring job",
        );

        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.config.absolute_timeout {
                tracing::error!(
                    job_id = %target.job_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Absolute timeout reached",
                );
                return WaitOutcome::Timeout { elapsed };
            }
            if elapsed >= soft_timeout {
                break;
            }

            let tick = tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(target),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(job_id = %target.job_id, "Detector tick still pending at deadline");
                    continue;
                }
                tick = self.tick(target) => tick,
            };

            let tick = match tick {
                Ok(tick) => tick,
                Err(message) => {
                    consecutive_unknowns += 1;
                    tracing::error!(
                        job_id = %target.job_id,
                        error = %message,
                        consecutive_unknowns,
                        "Monitor tick failed",
                    );
                    if !self.sleep(self.config.error_backoff.min(until(deadline)), cancel).await {
                        return self.cancelled(target);
                    }
                    continue;
                }
            };

            match tick.status {
                RemoteStatus::Completed => {
                    tracing::info!(
                        job_id = %target.job_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Job completed",
                    );
                    return WaitOutcome::Completed;
                }
                RemoteStatus::Failed => {
                    tracing::warn!(job_id = %target.job_id, detail = %tick.detail, "Job failed remotely");
                    return WaitOutcome::RemoteFailed { detail: tick.detail };
                }
                RemoteStatus::Running => {
                    consecutive_unknowns = 0;
                    last_known = Some(RemoteStatus::Running);
                }
                RemoteStatus::Unknown => {
                    consecutive_unknowns += 1;
                }
            }

            if let Some(callback) = on_tick {
                callback(target, tick.status);
            }

            if consecutive_unknowns >= self.config.emergency_threshold {
                tracing::warn!(
                    job_id = %target.job_id,
                    consecutive_unknowns,
                    "Status inconclusive, entering emergency mode",
                );
                match self.emergency_checks(target, deadline, cancel).await {
                    Some(outcome) => return outcome,
                    None => consecutive_unknowns = 0,
                }
            }

            let interval = self
                .config
                .poll
                .interval(start.elapsed(), consecutive_unknowns);
            // Wake up at the deadline rather than oversleeping it.
            if !self.sleep(interval.min(until(deadline)), cancel).await {
                return self.cancelled(target);
            }
        }

        tracing::warn!(
            job_id = %target.job_id,
            last_known = ?last_known,
            "Soft timeout reached, making a final history check",
        );
        let final_deadline = (Instant::now() + self.config.final_check_timeout).min(absolute_deadline);
        let checked = tokio::select! {
            _ = cancel.cancelled() => return self.cancelled(target),
            checked = self.history_check_until(target, final_deadline) => checked,
        };
        match checked {
            Some(outcome) => outcome,
            None => WaitOutcome::Timeout {
                elapsed: start.elapsed(),
            },
        }
    }

    // ---- private helpers ----

    /// Query every enabled, available detector concurrently.
    ///
    /// The checks run inside this future, so dropping it (on cancel or at
    /// the deadline) drops every outstanding check. A detector that panics
    /// makes the whole tick an error.
    async fn tick(&self, target: &DetectionTarget) -> Result<TickResult, String> {
        let checks = self
            .detectors
            .iter()
            .filter(|e| e.enabled.load(Ordering::Relaxed))
            .map(|e| {
                let detector = &e.detector;
                async move {
                    AssertUnwindSafe(async move {
                        if detector.is_available().await {
                            Some(detector.check(target).await)
                        } else {
                            tracing::debug!(detector = detector.name(), "Detector unavailable");
                            None
                        }
                    })
                    .catch_unwind()
                    .await
                    .map_err(|_| detector.name())
                }
            });

        let mut opinions: Vec<DetectorOpinion> = Vec::new();
        for joined in join_all(checks).await {
            match joined {
                Ok(Some(opinion)) => opinions.push(opinion),
                Ok(None) => {}
                Err(name) => return Err(format!("detector {name} panicked")),
            }
        }

        for opinion in &opinions {
            tracing::debug!(
                job_id = %target.job_id,
                detector = opinion.source,
                status = ?opinion.status,
                confidence = opinion.confidence,
                detail = %opinion.detail,
                "Detector opinion",
            );
        }

        let status = reconcile(&opinions);
        let detail = opinions
            .iter()
            .filter(|o| o.status == status)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|o| format!("{}: {}", o.source, o.detail))
            .unwrap_or_default();

        Ok(TickResult { status, detail })
    }

    /// Up to `emergency_checks` direct history lookups, spaced by
    /// `emergency_check_interval` and cut short at `deadline`. `None` means
    /// still inconclusive.
    async fn emergency_checks(
        &self,
        target: &DetectionTarget,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Option<WaitOutcome> {
        for check in 0..self.config.emergency_checks {
            if check > 0
                && !self
                    .sleep(self.config.emergency_check_interval.min(until(deadline)), cancel)
                    .await
            {
                return Some(self.cancelled(target));
            }
            if Instant::now() >= deadline {
                break;
            }
            let checked = tokio::select! {
                _ = cancel.cancelled() => return Some(self.cancelled(target)),
                checked = self.history_check_until(target, deadline) => checked,
            };
            if let Some(outcome) = checked {
                tracing::info!(job_id = %target.job_id, check, "Emergency check resolved job");
                return Some(outcome);
            }
        }
        tracing::warn!(job_id = %target.job_id, "Emergency checks inconclusive");
        None
    }

    /// [`Self::direct_history_check`], abandoned at `deadline`.
    async fn history_check_until(&self, target: &DetectionTarget, deadline: Instant) -> Option<WaitOutcome> {
        match tokio::time::timeout_at(deadline, self.direct_history_check(target)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(remote_id = %target.remote_id, "Direct history check still pending at deadline");
                None
            }
        }
    }

    async fn direct_history_check(&self, target: &DetectionTarget) -> Option<WaitOutcome> {
        match self.accessor.get_history(&target.remote_id).await {
            Ok(Some(record)) if record.is_error() => Some(WaitOutcome::RemoteFailed {
                detail: "history records an execution error".to_string(),
            }),
            Ok(Some(_)) => Some(WaitOutcome::Completed),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(remote_id = %target.remote_id, error = %e, "Direct history check failed");
                None
            }
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        sleep_or_cancel(duration, cancel).await
    }

    fn cancelled(&self, target: &DetectionTarget) -> WaitOutcome {
        tracing::info!(job_id = %target.job_id, "Monitoring cancelled");
        WaitOutcome::Cancelled
    }
}

/// Time left before `deadline`, zero once it has passed.
fn until(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
