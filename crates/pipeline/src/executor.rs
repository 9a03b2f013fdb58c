//! Job execution: submit a job, wait for it to resolve, retry on failure.
//!
//! [`JobExecutor::execute_once`] is one attempt: prepare the payload,
//! submit it, then hand the server-assigned id to the [`JobMonitor`].
//! [`JobExecutor::execute_with_retry`] and [`JobExecutor::execute_batch`]
//! layer exponential backoff and the health-check gate on top.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use genqueue_comfyui::accessor::RenderAccessor;
use genqueue_comfyui::reconnect::{wait_until_reachable, ReconnectConfig};
use genqueue_core::job::{FailureReason, Job, JobStatus};
use genqueue_core::progress::success_rate;
use genqueue_core::scheduling::retry_backoff;
use genqueue_core::types::{JobId, RemoteId};

use crate::config::ExecutorConfig;
use crate::detectors::DetectionTarget;
use crate::monitor::{sleep_or_cancel, JobMonitor, TickCallback};
use crate::workflow::{prepare_payload, WorkflowTemplate};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of [`JobExecutor::execute_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs never attempted because the batch stopped early.
    pub skipped: usize,
    pub failures: Vec<(JobId, FailureReason)>,
    pub duration_secs: f64,
    pub success_rate: f64,
}

/// Counters over every [`JobExecutor::execute_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorStatistics {
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Mean duration of successful executions.
    pub average_duration_secs: f64,
    pub total_duration_secs: f64,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    failed: usize,
    total_duration_secs: f64,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct JobExecutor {
    accessor: Arc<dyn RenderAccessor>,
    monitor: Arc<JobMonitor>,
    config: ExecutorConfig,
    reconnect: ReconnectConfig,
    template: Option<WorkflowTemplate>,
    tally: Mutex<Tally>,
}

impl JobExecutor {
    pub fn new(
        accessor: Arc<dyn RenderAccessor>,
        monitor: Arc<JobMonitor>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            accessor,
            monitor,
            config,
            reconnect: ReconnectConfig::default(),
            template: None,
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Inject prompts and parameters into `template` for non-graph jobs.
    pub fn with_template(mut self, template: WorkflowTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Backoff used by the batch health gate while the service is down.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<JobMonitor> {
        &self.monitor
    }

    /// Whether the rendering service answers its health probe.
    pub async fn health_check(&self) -> bool {
        let reachable = self.accessor.is_reachable().await;
        if !reachable {
            tracing::warn!("Health check failed: rendering service unreachable");
        }
        reachable
    }

    /// Wait out a lost submission: sleep the initial reconnect delay, then
    /// probe until the service answers. Returns `false` if cancelled.
    pub async fn wait_for_service(&self, cancel: &CancellationToken) -> bool {
        sleep_or_cancel(self.reconnect.initial_delay, cancel).await
            && wait_until_reachable(self.accessor.as_ref(), &self.reconnect, cancel).await
    }

    /// Prepare and submit `job`, returning the server-assigned id.
    ///
    /// Transport errors are reported as [`FailureReason::Transport`] and are
    /// not retried here.
    pub async fn submit(&self, job: &Job) -> Result<RemoteId, FailureReason> {
        let payload = prepare_payload(job, self.template.as_ref())?;

        match self.accessor.submit(&payload).await {
            Ok(remote_id) => {
                tracing::info!(
                    job_id = %job.id(),
                    remote_id = %remote_id,
                    attempt = job.attempt_count,
                    "Job submitted",
                );
                Ok(remote_id)
            }
            Err(e) if e.is_transport() => {
                tracing::error!(job_id = %job.id(), error = %e, "Submission failed: service unreachable");
                Err(FailureReason::Transport {
                    message: e.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Submission rejected");
                Err(FailureReason::SubmissionRejected {
                    message: e.to_string(),
                })
            }
        }
    }

    /// One attempt: submit, then wait up to the configured job timeout.
    ///
    /// Records the remote id, completion time, final status and (on
    /// success) the duration on `job`. The attempt counter is left to the
    /// caller.
    pub async fn execute_once(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        on_tick: Option<&TickCallback>,
    ) -> Result<(), FailureReason> {
        let started = Instant::now();

        let submitted = tokio::select! {
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            submitted = self.submit(job) => submitted,
        };

        let result = match submitted {
            Ok(remote_id) => {
                job.remote_id = Some(remote_id.clone());
                let target = DetectionTarget::new(job.id(), remote_id);
                self.monitor
                    .wait_for_completion(&target, self.config.job_timeout, cancel, on_tick)
                    .await
                    .into_result()
            }
            Err(reason) => Err(reason),
        };

        let elapsed_secs = started.elapsed().as_secs_f64();
        job.completed_at = Some(chrono::Utc::now());
        let mut tally = self.tally.lock().unwrap_or_else(|p| p.into_inner());
        match &result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.duration_secs = Some(elapsed_secs);
                job.last_error = None;
                tally.completed += 1;
                tally.total_duration_secs += elapsed_secs;
            }
            Err(reason) => {
                job.status = match reason {
                    FailureReason::Cancelled => JobStatus::Cancelled,
                    _ => JobStatus::Failed,
                };
                job.last_error = Some(reason.clone());
                tally.failed += 1;
            }
        }
        result
    }

    /// Run `job` up to `max_attempts` times (the job's own budget when
    /// `None`), sleeping `retry_backoff` between attempts.
    ///
    /// When every attempt fails the job ends `Failed` with
    /// [`FailureReason::RetryExhausted`] wrapping the last error. A
    /// cancellation ends the loop immediately. A transport failure does not
    /// use up an attempt: the loop waits for the service and resubmits.
    pub async fn execute_with_retry(
        &self,
        job: &mut Job,
        max_attempts: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<(), FailureReason> {
        let max_attempts = max_attempts.unwrap_or(job.max_retries).max(1);
        let mut attempt = 0u32;

        let last = loop {
            attempt += 1;
            job.begin_attempt();

            let reason = match self.execute_once(job, cancel, None).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(job_id = %job.id(), attempt, "Job succeeded after retry");
                    }
                    return Ok(());
                }
                Err(reason) => reason,
            };

            if matches!(reason, FailureReason::Transport { .. }) {
                attempt -= 1;
                job.attempt_count = job.attempt_count.saturating_sub(1);
                tracing::warn!(
                    job_id = %job.id(),
                    error = %reason,
                    "Submission lost, waiting for service before resubmitting",
                );
                job.reset_attempt_state();
                job.status = JobStatus::RetryScheduled;
                job.last_error = Some(reason);
                if !self.wait_for_service(cancel).await {
                    job.status = JobStatus::Cancelled;
                    job.last_error = Some(FailureReason::Cancelled);
                    return Err(FailureReason::Cancelled);
                }
                continue;
            }

            if reason == FailureReason::Cancelled || attempt >= max_attempts {
                break reason;
            }

            let delay = retry_backoff(attempt - 1, self.config.backoff_base, self.config.backoff_ceiling);
            tracing::warn!(
                job_id = %job.id(),
                attempt,
                max_attempts,
                error = %reason,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying",
            );
            job.reset_attempt_state();
            job.status = JobStatus::RetryScheduled;
            job.last_error = Some(reason);

            if !sleep_or_cancel(delay, cancel).await {
                job.status = JobStatus::Cancelled;
                job.last_error = Some(FailureReason::Cancelled);
                return Err(FailureReason::Cancelled);
            }
        };

        if last == FailureReason::Cancelled {
            return Err(last);
        }

        let failure = if attempt > 1 {
            FailureReason::RetryExhausted {
                attempts: attempt,
                last: Box::new(last),
            }
        } else {
            last
        };
        tracing::error!(job_id = %job.id(), attempts = attempt, error = %failure, "Job failed");
        job.status = JobStatus::Failed;
        job.last_error = Some(failure.clone());
        Err(failure)
    }

    /// Execute `jobs` in order, pausing between them.
    ///
    /// Before each job the health gate runs; while the service is down the
    /// batch waits for it with exponential backoff instead of burning
    /// retries. With `stop_on_error` the first failed job ends the batch.
    pub async fn execute_batch(
        &self,
        jobs: &mut [Job],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let total = jobs.len();
        let mut report = BatchReport {
            total,
            ..Default::default()
        };

        tracing::info!(total, stop_on_error, "Batch started");

        for (index, job) in jobs.iter_mut().enumerate() {
            if index > 0 && !sleep_or_cancel(self.config.batch_delay, cancel).await {
                report.skipped = total - index;
                break;
            }

            if !self.health_check().await
                && !wait_until_reachable(self.accessor.as_ref(), &self.reconnect, cancel).await
            {
                report.skipped = total - index;
                break;
            }

            match self.execute_with_retry(job, None, cancel).await {
                Ok(()) => report.completed += 1,
                Err(reason) => {
                    let cancelled = reason == FailureReason::Cancelled;
                    report.failed += 1;
                    report.failures.push((job.id().to_string(), reason));
                    if cancelled || stop_on_error {
                        report.skipped = total - index - 1;
                        break;
                    }
                }
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        report.success_rate = success_rate(report.completed, report.failed);
        tracing::info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            duration_secs = report.duration_secs,
            "Batch finished",
        );
        report
    }

    pub fn statistics(&self) -> ExecutorStatistics {
        let tally = self.tally.lock().unwrap_or_else(|p| p.into_inner());
        let average_duration_secs = if tally.completed == 0 {
            0.0
        } else {
            tally.total_duration_secs / tally.completed as f64
        };
        ExecutorStatistics {
            completed: tally.completed,
            failed: tally.failed,
            success_rate: success_rate(tally.completed, tally.failed),
            average_duration_secs,
            total_duration_secs: tally.total_duration_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
