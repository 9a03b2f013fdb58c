//! Priority job queue with retry re-insertion.
//!
//! The queue owns the canonical [`Job`] records. Each job sits in exactly
//! one of five sets (pending, running, completed, failed, cancelled);
//! the job's `status` field always agrees with the set it is in.
//!
//! Pending work is split in two lanes: retries are served before fresh
//! jobs, fresh jobs by priority descending with ties in insertion order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;

use genqueue_core::job::{FailureReason, Job, JobStatus, WorkflowParams};
use genqueue_core::naming::{batch_job_id, validate_job_id};
use genqueue_core::progress::{average_secs, success_rate, QueueSnapshot};
use genqueue_core::types::{JobId, Timestamp};

use crate::error::QueueError;

/// Prefix of ids generated by [`JobQueue::enqueue_prompts`].
pub const BATCH_ID_PREFIX: &str = "batch";

/// What happened to a job when its attempt was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    /// Re-inserted at the front of the pending set. `attempt` attempts of
    /// `max` have been used.
    RetryScheduled { attempt: u32, max: u32 },
    /// Retry budget exhausted.
    Failed { attempts: u32 },
}

impl CompletionOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

/// Key ordering fresh jobs: priority descending, then insertion order.
type FreshKey = (Reverse<i32>, u64);

struct Slot {
    job: Job,
    seq: u64,
}

/// Priority queue of generation jobs.
#[derive(Default)]
pub struct JobQueue {
    slots: HashMap<JobId, Slot>,
    retry_lane: VecDeque<JobId>,
    fresh: BTreeMap<FreshKey, JobId>,
    running: HashSet<JobId>,
    completed: Vec<JobId>,
    failed: Vec<JobId>,
    cancelled: Vec<JobId>,

    next_seq: u64,
    next_batch_index: usize,
    total_added: usize,
    total_processed: usize,

    consecutive_retries: u32,
    max_consecutive_retries: Option<u32>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on retries served back to back while fresh work is waiting.
    ///
    /// `None` (the default) always serves retries first.
    pub fn with_max_consecutive_retries(mut self, cap: Option<u32>) -> Self {
        self.max_consecutive_retries = cap;
        self
    }

    // ---- insertion ----

    /// Add a job to the pending set.
    ///
    /// Whatever status the job carried is reset to `Pending`. Ids are
    /// unique for the lifetime of the queue, including finished jobs, and
    /// must be safe to embed in output filenames.
    pub fn enqueue(&mut self, mut job: Job) -> Result<JobId, QueueError> {
        let id = job.id().to_string();
        validate_job_id(&id)?;
        if self.slots.contains_key(&id) {
            return Err(QueueError::DuplicateId(id));
        }

        job.status = JobStatus::Pending;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.fresh.insert((Reverse(job.priority), seq), id.clone());
        tracing::debug!(job_id = %id, priority = job.priority, "Job enqueued");
        self.slots.insert(id.clone(), Slot { job, seq });
        self.total_added += 1;

        Ok(id)
    }

    /// Create one job per prompt with generated batch ids.
    ///
    /// Every job gets a copy of `base_params`. Returns the ids in prompt
    /// order.
    pub fn enqueue_prompts<I, S>(
        &mut self,
        prompts: I,
        workflow_type: &str,
        base_params: &WorkflowParams,
        priority: i32,
        max_retries: u32,
    ) -> Vec<JobId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let created_at = chrono::Utc::now();
        let mut ids = Vec::new();

        for prompt in prompts {
            let id = self.next_batch_id(created_at);
            let job = Job::new(id, prompt)
                .with_workflow_type(workflow_type)
                .with_params(base_params.clone())
                .with_priority(priority)
                .with_max_retries(max_retries);

            // next_batch_id only hands out unused ids.
            if let Ok(id) = self.enqueue(job) {
                ids.push(id);
            }
        }

        tracing::info!(count = ids.len(), workflow_type, "Batch jobs enqueued");
        ids
    }

    fn next_batch_id(&mut self, created_at: Timestamp) -> JobId {
        loop {
            let id = batch_job_id(BATCH_ID_PREFIX, created_at, self.next_batch_index);
            self.next_batch_index += 1;
            if !self.slots.contains_key(&id) {
                return id;
            }
        }
    }

    // ---- dispatch ----

    /// Take the next pending job and move it to the running set.
    ///
    /// Returns a copy of the job with the new attempt already counted and
    /// `started_at` stamped, or `None` when nothing is pending.
    pub fn dequeue(&mut self) -> Option<Job> {
        let id = self.pick_next()?;
        self.running.insert(id.clone());

        let slot = self.slots.get_mut(&id)?;
        slot.job.begin_attempt();
        tracing::debug!(
            job_id = %id,
            attempt = slot.job.attempt_count,
            max_retries = slot.job.max_retries,
            "Job dequeued",
        );
        Some(slot.job.clone())
    }

    fn pick_next(&mut self) -> Option<JobId> {
        let retry_capped = self
            .max_consecutive_retries
            .is_some_and(|cap| self.consecutive_retries >= cap);

        if !self.retry_lane.is_empty() && !(retry_capped && !self.fresh.is_empty()) {
            self.consecutive_retries += 1;
            return self.retry_lane.pop_front();
        }

        self.consecutive_retries = 0;
        self.fresh.pop_first().map(|(_, id)| id)
    }

    /// Copy attempt details from the executor's working copy onto the
    /// canonical record of a running job.
    ///
    /// Only `remote_id`, `duration_secs` and `output_files` are taken.
    pub fn record_attempt_details(&mut self, attempt: &Job) -> Result<(), QueueError> {
        let id = attempt.id();
        self.ensure_running(id)?;
        if let Some(slot) = self.slots.get_mut(id) {
            slot.job.remote_id = attempt.remote_id.clone();
            slot.job.duration_secs = attempt.duration_secs;
            slot.job.output_files = attempt.output_files.clone();
        }
        Ok(())
    }

    /// Resolve the current attempt of a running job.
    ///
    /// On failure the job is re-inserted at the front of the pending set
    /// while its retry budget lasts, otherwise it moves to failed.
    pub fn complete(
        &mut self,
        job_id: &str,
        result: Result<(), FailureReason>,
    ) -> Result<CompletionOutcome, QueueError> {
        self.ensure_running(job_id)?;
        let slot = self
            .slots
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        self.running.remove(job_id);
        self.total_processed += 1;
        let job = &mut slot.job;
        let now = chrono::Utc::now();

        let outcome = match result {
            Ok(()) => {
                set_status(job, JobStatus::Completed);
                job.completed_at = Some(now);
                job.last_error = None;
                if job.duration_secs.is_none() {
                    job.duration_secs = job.elapsed_secs();
                }
                self.completed.push(job_id.to_string());
                tracing::debug!(job_id, attempt = job.attempt_count, "Job completed");
                CompletionOutcome::Completed
            }
            Err(reason) if job.has_attempts_left() => {
                tracing::info!(
                    job_id,
                    attempt = job.attempt_count,
                    max_retries = job.max_retries,
                    error = %reason,
                    "Job failed, retry scheduled",
                );
                set_status(job, JobStatus::RetryScheduled);
                job.completed_at = None;
                job.last_error = Some(reason);
                self.retry_lane.push_front(job_id.to_string());
                CompletionOutcome::RetryScheduled {
                    attempt: job.attempt_count,
                    max: job.max_retries,
                }
            }
            Err(reason) => {
                let attempts = job.attempt_count;
                tracing::warn!(job_id, attempts, error = %reason, "Job failed permanently");
                set_status(job, JobStatus::Failed);
                job.completed_at = Some(now);
                job.last_error = Some(if attempts > 1 {
                    FailureReason::RetryExhausted {
                        attempts,
                        last: Box::new(reason),
                    }
                } else {
                    reason
                });
                self.failed.push(job_id.to_string());
                CompletionOutcome::Failed { attempts }
            }
        };

        Ok(outcome)
    }

    /// Put a running job back at the front of the pending set without
    /// charging the attempt it just made.
    ///
    /// Used when the submission never reached the service. `reason` is kept
    /// as the job's last error.
    pub fn requeue_uncounted(&mut self, job_id: &str, reason: FailureReason) -> Result<(), QueueError> {
        self.ensure_running(job_id)?;
        let slot = self
            .slots
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        self.running.remove(job_id);
        let job = &mut slot.job;
        job.attempt_count = job.attempt_count.saturating_sub(1);
        set_status(job, JobStatus::RetryScheduled);
        job.started_at = None;
        job.completed_at = None;
        tracing::info!(
            job_id,
            attempt_count = job.attempt_count,
            error = %reason,
            "Job requeued, attempt not charged",
        );
        job.last_error = Some(reason);
        self.retry_lane.push_front(job_id.to_string());
        Ok(())
    }

    fn ensure_running(&self, job_id: &str) -> Result<(), QueueError> {
        let slot = self
            .slots
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let status = slot.job.status;
        if status.is_terminal() {
            return Err(QueueError::AlreadyTerminal {
                id: job_id.to_string(),
                status,
            });
        }
        if !self.running.contains(job_id) {
            return Err(QueueError::NotRunning {
                id: job_id.to_string(),
                status,
            });
        }
        Ok(())
    }

    // ---- cancellation ----

    /// Cancel a pending or running job.
    ///
    /// Returns `false` for unknown ids and jobs that already finished. A
    /// cancelled running job's submission is not recalled; a later
    /// `complete` for it reports [`QueueError::AlreadyTerminal`].
    pub fn cancel(&mut self, job_id: &str) -> bool {
        let Some(slot) = self.slots.get(job_id) else {
            return false;
        };
        let (status, key) = (slot.job.status, (Reverse(slot.job.priority), slot.seq));

        let removed = match status {
            JobStatus::Pending => self.fresh.remove(&key).is_some(),
            JobStatus::RetryScheduled => {
                let before = self.retry_lane.len();
                self.retry_lane.retain(|id| id != job_id);
                self.retry_lane.len() != before
            }
            JobStatus::Running => self.running.remove(job_id),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        };
        if !removed {
            return false;
        }

        self.mark_cancelled(job_id);
        tracing::info!(job_id, previous = %status, "Job cancelled");
        true
    }

    /// Cancel every pending job. Running jobs are left to finish.
    ///
    /// Returns the number of jobs cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<JobId> = self
            .retry_lane
            .drain(..)
            .chain(std::mem::take(&mut self.fresh).into_values())
            .collect();

        for id in &ids {
            self.mark_cancelled(id);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Pending jobs cancelled");
        }
        ids.len()
    }

    fn mark_cancelled(&mut self, job_id: &str) {
        if let Some(slot) = self.slots.get_mut(job_id) {
            set_status(&mut slot.job, JobStatus::Cancelled);
            slot.job.completed_at = Some(chrono::Utc::now());
            slot.job.last_error = Some(FailureReason::Cancelled);
            self.cancelled.push(job_id.to_string());
        }
    }

    // ---- views ----

    /// Aggregate counters, computed from set sizes in O(1).
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            cancelled: self.cancelled.len(),
            total_added: self.total_added,
            total_processed: self.total_processed,
            success_rate: success_rate(self.completed.len(), self.failed.len()),
        }
    }

    /// Jobs waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.retry_lane.len() + self.fresh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.slots.get(job_id).map(|slot| &slot.job)
    }

    /// Pending jobs in dispatch order (ignoring the retry cap).
    pub fn pending_jobs(&self) -> Vec<Job> {
        let ids = self.retry_lane.iter().chain(self.fresh.values());
        self.collect(ids)
    }

    /// Running jobs, oldest start first.
    pub fn running_jobs(&self) -> Vec<Job> {
        let mut jobs = self.collect(self.running.iter());
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    pub fn completed_jobs(&self) -> Vec<Job> {
        self.collect(self.completed.iter())
    }

    pub fn failed_jobs(&self) -> Vec<Job> {
        self.collect(self.failed.iter())
    }

    pub fn cancelled_jobs(&self) -> Vec<Job> {
        self.collect(self.cancelled.iter())
    }

    fn collect<'a>(&self, ids: impl Iterator<Item = &'a JobId>) -> Vec<Job> {
        ids.filter_map(|id| self.get(id)).cloned().collect()
    }

    /// Counters plus timing, priority and retry breakdowns.
    pub fn statistics(&self) -> QueueStatistics {
        let finished = self.completed.iter().chain(self.failed.iter());
        let (total_retries, jobs_with_retries) = finished
            .filter_map(|id| self.get(id))
            .map(|job| job.attempt_count.saturating_sub(1))
            .fold((0u32, 0usize), |(total, jobs), retries| {
                (total + retries, jobs + usize::from(retries > 0))
            });

        let durations: Vec<f64> = self
            .completed
            .iter()
            .filter_map(|id| self.get(id))
            .filter_map(Job::elapsed_secs)
            .collect();

        let mut priority_distribution = BTreeMap::new();
        for job in self.retry_lane.iter().chain(self.fresh.values()).filter_map(|id| self.get(id)) {
            *priority_distribution.entry(job.priority).or_insert(0) += 1;
        }

        QueueStatistics {
            snapshot: self.snapshot(),
            average_processing_secs: average_secs(&durations),
            priority_distribution,
            retries: RetryStatistics {
                total_retries,
                jobs_with_retries,
            },
        }
    }

    /// Serializable dump of every set plus statistics.
    pub fn export_state(&self) -> QueueExport {
        QueueExport {
            exported_at: chrono::Utc::now(),
            pending: self.pending_jobs(),
            running: self.running_jobs(),
            completed: self.completed_jobs(),
            failed: self.failed_jobs(),
            cancelled: self.cancelled_jobs(),
            statistics: self.statistics(),
        }
    }
}

fn set_status(job: &mut Job, to: JobStatus) {
    debug_assert!(
        job.status.can_transition_to(to),
        "invalid transition {} -> {to}",
        job.status,
    );
    job.status = to;
}

/// Retry counts over finished jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStatistics {
    /// Attempts beyond the first, summed over completed and failed jobs.
    pub total_retries: u32,
    pub jobs_with_retries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatistics {
    #[serde(flatten)]
    pub snapshot: QueueSnapshot,
    /// Mean `started_at..completed_at` of completed jobs' final attempts.
    pub average_processing_secs: f64,
    /// Pending job count per priority.
    pub priority_distribution: BTreeMap<i32, usize>,
    pub retries: RetryStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueExport {
    pub exported_at: Timestamp,
    pub pending: Vec<Job>,
    pub running: Vec<Job>,
    pub completed: Vec<Job>,
    pub failed: Vec<Job>,
    pub cancelled: Vec<Job>,
    pub statistics: QueueStatistics,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn job(id: &str, priority: i32) -> Job {
        Job::new(id, format!("prompt for {id}")).with_priority(priority)
    }

    fn dequeue_id(queue: &mut JobQueue) -> Option<String> {
        queue.dequeue().map(|j| j.id().to_string())
    }

    fn fail() -> Result<(), FailureReason> {
        Err(FailureReason::RemoteFailed {
            message: "boom".into(),
        })
    }

    /// Every known id appears in exactly one set, matching its status.
    fn assert_sets_exclusive(queue: &JobQueue) {
        let sets: [(Vec<&JobId>, JobStatus); 6] = [
            (queue.retry_lane.iter().collect(), JobStatus::RetryScheduled),
            (queue.fresh.values().collect(), JobStatus::Pending),
            (queue.running.iter().collect(), JobStatus::Running),
            (queue.completed.iter().collect(), JobStatus::Completed),
            (queue.failed.iter().collect(), JobStatus::Failed),
            (queue.cancelled.iter().collect(), JobStatus::Cancelled),
        ];

        let mut seen = HashSet::new();
        for (ids, expected) in &sets {
            for id in ids {
                assert_eq!(queue.get(id).map(|j| j.status), Some(*expected), "{id}");
                assert!(seen.insert(id.as_str()), "{id} in two sets");
            }
        }
        assert_eq!(seen.len(), queue.slots.len());
    }

    // -- ordering --

    #[test]
    fn dequeues_highest_priority_first() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("p1", 1)).unwrap();
        queue.enqueue(job("p5", 5)).unwrap();
        queue.enqueue(job("p3", 3)).unwrap();

        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("p5"));
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("p3"));
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("p1"));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let mut queue = JobQueue::new();
        for id in ["a", "b", "c"] {
            queue.enqueue(job(id, 2)).unwrap();
        }
        queue.enqueue(job("urgent", 9)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| dequeue_id(&mut queue)).collect();
        assert_eq!(order, vec!["urgent", "a", "b", "c"]);
    }

    #[test]
    fn empty_queue_returns_none() {
        let mut queue = JobQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        assert_matches!(queue.enqueue(job("a", 3)), Err(QueueError::DuplicateId(id)) if id == "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unsafe_id_rejected() {
        let mut queue = JobQueue::new();
        assert_matches!(queue.enqueue(job("../out", 0)), Err(QueueError::InvalidId(_)));
        assert_matches!(queue.enqueue(job("", 0)), Err(QueueError::InvalidId(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_stamps_start_and_counts_attempt() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        let running = queue.dequeue().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);
        assert!(running.started_at.is_some());
        assert_eq!(queue.snapshot().running, 1);
    }

    // -- retries --

    #[test]
    fn failed_job_is_retried_before_fresh_work() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("first", 1)).unwrap();
        queue.enqueue(job("urgent", 10)).unwrap();
        queue.enqueue(job("low", 0)).unwrap();

        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("urgent"));
        let outcome = queue.complete("urgent", fail()).unwrap();
        assert_eq!(outcome, CompletionOutcome::RetryScheduled { attempt: 1, max: 3 });
        assert_eq!(queue.get("urgent").unwrap().status, JobStatus::RetryScheduled);

        queue.enqueue(job("later-urgent", 20)).unwrap();
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("urgent"));
        assert_sets_exclusive(&queue);
    }

    #[test]
    fn always_failing_job_attempted_exactly_max_retries_times() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("doomed", 0).with_max_retries(4)).unwrap();

        let mut attempts = 0;
        while let Some(j) = queue.dequeue() {
            attempts += 1;
            queue.complete(j.id(), fail()).unwrap();
            assert_sets_exclusive(&queue);
        }

        assert_eq!(attempts, 4);
        let doomed = queue.get("doomed").unwrap();
        assert_eq!(doomed.status, JobStatus::Failed);
        assert_eq!(doomed.attempt_count, 4);
        assert_matches!(
            doomed.last_error,
            Some(FailureReason::RetryExhausted { attempts: 4, .. })
        );
    }

    #[test]
    fn fails_twice_then_succeeds() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("flaky", 0).with_max_retries(3)).unwrap();

        for _ in 0..2 {
            let j = queue.dequeue().unwrap();
            assert_matches!(
                queue.complete(j.id(), fail()),
                Ok(CompletionOutcome::RetryScheduled { .. })
            );
        }
        let j = queue.dequeue().unwrap();
        assert_eq!(queue.complete(j.id(), Ok(())).unwrap(), CompletionOutcome::Completed);

        let flaky = queue.get("flaky").unwrap();
        assert_eq!(flaky.status, JobStatus::Completed);
        assert_eq!(flaky.attempt_count, 3);
        assert!(flaky.last_error.is_none());
    }

    #[test]
    fn single_attempt_failure_keeps_plain_reason() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("once", 0).with_max_retries(1)).unwrap();
        queue.dequeue().unwrap();
        assert_eq!(
            queue.complete("once", fail()).unwrap(),
            CompletionOutcome::Failed { attempts: 1 }
        );
        assert_matches!(
            queue.get("once").unwrap().last_error,
            Some(FailureReason::RemoteFailed { .. })
        );
    }

    #[test]
    fn retry_cap_lets_fresh_job_through() {
        let mut queue = JobQueue::new().with_max_consecutive_retries(Some(1));
        queue.enqueue(job("a", 5).with_max_retries(5)).unwrap();
        queue.enqueue(job("b", 5).with_max_retries(5)).unwrap();
        queue.enqueue(job("fresh", 0)).unwrap();

        queue.dequeue().unwrap();
        queue.complete("a", fail()).unwrap();
        // First retry is served.
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("a"));
        queue.complete("a", fail()).unwrap();
        // Cap reached: a fresh job goes next.
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("b"));
        queue.complete("b", Ok(())).unwrap();
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("a"));
    }

    #[test]
    fn record_attempt_details_updates_canonical_record() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        let mut working = queue.dequeue().unwrap();
        working.remote_id = Some("remote-1".into());
        working.output_files = vec!["a_00001_.png".into()];
        working.duration_secs = Some(4.5);

        queue.record_attempt_details(&working).unwrap();
        queue.complete("a", Ok(())).unwrap();

        let stored = queue.get("a").unwrap();
        assert_eq!(stored.remote_id.as_deref(), Some("remote-1"));
        assert_eq!(stored.output_files, vec!["a_00001_.png"]);
        assert_eq!(stored.duration_secs, Some(4.5));
    }

    #[test]
    fn uncounted_requeue_keeps_attempt_budget() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0).with_max_retries(1)).unwrap();
        queue.enqueue(job("b", 5)).unwrap();
        assert_eq!(dequeue_id(&mut queue).as_deref(), Some("b"));
        queue.complete("b", Ok(())).unwrap();
        queue.dequeue().unwrap();

        let lost = FailureReason::Transport {
            message: "request timed out".into(),
        };
        queue.requeue_uncounted("a", lost).unwrap();

        let a = queue.get("a").unwrap();
        assert_eq!(a.status, JobStatus::RetryScheduled);
        assert_eq!(a.attempt_count, 0);
        assert_matches!(a.last_error, Some(FailureReason::Transport { .. }));
        assert_eq!(queue.snapshot().total_processed, 1);
        assert_sets_exclusive(&queue);

        // The single allowed attempt is still available.
        let again = queue.dequeue().unwrap();
        assert_eq!(again.attempt_count, 1);
        assert_eq!(queue.complete("a", Ok(())).unwrap(), CompletionOutcome::Completed);
    }

    #[test]
    fn uncounted_requeue_of_pending_job_is_rejected() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        assert_matches!(
            queue.requeue_uncounted("a", FailureReason::Cancelled),
            Err(QueueError::NotRunning { .. })
        );
        assert_eq!(queue.get("a").unwrap().status, JobStatus::Pending);
    }

    // -- invalid operations --

    #[test]
    fn complete_unknown_job_is_not_found() {
        let mut queue = JobQueue::new();
        assert_matches!(queue.complete("ghost", Ok(())), Err(QueueError::NotFound(_)));
    }

    #[test]
    fn complete_pending_job_is_not_running() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        assert_matches!(
            queue.complete("a", Ok(())),
            Err(QueueError::NotRunning { status: JobStatus::Pending, .. })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn complete_twice_is_already_terminal() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        queue.dequeue().unwrap();
        queue.complete("a", Ok(())).unwrap();
        assert_matches!(
            queue.complete("a", Ok(())),
            Err(QueueError::AlreadyTerminal { status: JobStatus::Completed, .. })
        );
        assert_eq!(queue.snapshot().completed, 1);
    }

    // -- cancellation --

    #[test]
    fn cancel_all_leaves_running_job() {
        let mut queue = JobQueue::new();
        for i in 0..6 {
            queue.enqueue(job(&format!("job-{i}"), 0)).unwrap();
        }
        let running = queue.dequeue().unwrap();

        assert_eq!(queue.cancel_all(), 5);

        let snap = queue.snapshot();
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.running, 1);
        assert_eq!(snap.cancelled, 5);
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.get(running.id()).unwrap().status, JobStatus::Running);
        assert_sets_exclusive(&queue);
    }

    #[test]
    fn cancel_all_includes_retry_lane() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        queue.dequeue().unwrap();
        queue.complete("a", fail()).unwrap();

        assert_eq!(queue.cancel_all(), 1);
        assert_eq!(queue.get("a").unwrap().status, JobStatus::Cancelled);
        assert_sets_exclusive(&queue);
    }

    #[test]
    fn cancel_pending_and_running() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 1)).unwrap();
        queue.enqueue(job("b", 0)).unwrap();
        queue.dequeue().unwrap();

        assert!(queue.cancel("a"));
        assert!(queue.cancel("b"));
        assert!(queue.is_empty());
        assert_eq!(queue.snapshot().running, 0);
        assert_matches!(
            queue.complete("a", Ok(())),
            Err(QueueError::AlreadyTerminal { status: JobStatus::Cancelled, .. })
        );
        assert_sets_exclusive(&queue);
    }

    #[test]
    fn cancel_finished_or_unknown_is_false() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        queue.dequeue().unwrap();
        queue.complete("a", Ok(())).unwrap();

        assert!(!queue.cancel("a"));
        assert!(!queue.cancel("ghost"));
        assert_eq!(queue.get("a").unwrap().status, JobStatus::Completed);
    }

    // -- views --

    #[test]
    fn snapshot_counts_and_rate() {
        let mut queue = JobQueue::new();
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(job(id, 0).with_max_retries(1)).unwrap();
        }
        queue.dequeue().unwrap();
        queue.complete("a", Ok(())).unwrap();
        queue.dequeue().unwrap();
        queue.complete("b", fail()).unwrap();
        queue.dequeue().unwrap();

        let snap = queue.snapshot();
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.running, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total_added, 4);
        assert_eq!(snap.total_processed, 2);
        assert_eq!(snap.success_rate, 0.5);
    }

    #[test]
    fn enqueue_prompts_generates_unique_batch_ids() {
        let mut queue = JobQueue::new();
        let mut params = WorkflowParams::new();
        params.insert("steps".into(), serde_json::json!(20));

        let first = queue.enqueue_prompts(["a cat", "a dog"], "txt2img", &params, 0, 2);
        let second = queue.enqueue_prompts(vec!["a bird".to_string()], "txt2img", &params, 0, 2);

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().chain(&second).all(|id| id.starts_with("batch_")));
        assert_ne!(first[0], first[1]);
        assert!(!first.contains(&second[0]));

        let stored = queue.get(&first[1]).unwrap();
        assert_eq!(stored.prompt(), "a dog");
        assert_eq!(stored.workflow_params()["steps"], 20);
        assert_eq!(stored.max_retries, 2);
    }

    #[test]
    fn statistics_track_retries_and_priorities() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("retried", 5)).unwrap();
        queue.enqueue(job("waiting-1", 1)).unwrap();
        queue.enqueue(job("waiting-2", 1)).unwrap();

        queue.dequeue().unwrap();
        queue.complete("retried", fail()).unwrap();
        queue.dequeue().unwrap();
        queue.complete("retried", Ok(())).unwrap();

        let stats = queue.statistics();
        assert_eq!(stats.retries.total_retries, 1);
        assert_eq!(stats.retries.jobs_with_retries, 1);
        assert_eq!(stats.priority_distribution.get(&1), Some(&2));
        assert_eq!(stats.snapshot.completed, 1);
    }

    #[test]
    fn export_state_serializes() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a", 0)).unwrap();
        queue.enqueue(job("b", 0)).unwrap();
        queue.dequeue().unwrap();

        let value = serde_json::to_value(queue.export_state()).unwrap();
        assert_eq!(value["pending"].as_array().unwrap().len(), 1);
        assert_eq!(value["running"][0]["status"], "running");
        assert_eq!(value["statistics"]["total_added"], 2);
    }
}
