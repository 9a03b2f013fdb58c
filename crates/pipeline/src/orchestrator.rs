//! The orchestrator: owns the queue, executor and progress aggregator and
//! runs the processing loop on a background task.
//!
//! One job is in flight at a time. Each iteration of the loop:
//!
//! 1. waits while paused,
//! 2. runs the health gate (an unreachable backend pauses the loop and,
//!    with `auto_resume`, waits for it to come back),
//! 3. dequeues the next job and sleeps the retry backoff if it is a retry,
//! 4. executes one attempt and resolves it on the queue,
//! 5. hands terminal jobs to the [`ResultStore`],
//! 6. publishes a progress snapshot and sleeps the inter-job delay.
//!
//! The loop ends when the queue drains or on [`Orchestrator::stop`].
//! Lock order is always queue before progress.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genqueue_comfyui::accessor::RenderAccessor;
use genqueue_comfyui::reconnect::wait_until_reachable;
use genqueue_core::job::{FailureReason, Job, WorkflowParams};
use genqueue_core::progress::{success_rate, ProgressSnapshot, QueueSnapshot};
use genqueue_core::reconcile::RemoteStatus;
use genqueue_core::scheduling::retry_backoff;
use genqueue_core::types::JobId;

use crate::config::OrchestratorConfig;
use crate::detectors::DetectionTarget;
use crate::error::PipelineError;
use crate::executor::JobExecutor;
use crate::monitor::{sleep_or_cancel, JobMonitor, TickCallback};
use crate::progress::{ObserverId, ProgressAggregator};
use crate::queue::{CompletionOutcome, JobQueue};
use crate::store::{find_output_files, ResultStore};
use crate::workflow::WorkflowTemplate;

/// Fraction reported for the current job while the service runs it.
const RUNNING_FRACTION: f64 = 0.5;

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub queue: QueueSnapshot,
    pub progress: Option<ProgressSnapshot>,
}

/// One finished job as reported by [`Orchestrator::batch_results`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub prompt: String,
    pub attempts: u32,
    pub duration_secs: Option<f64>,
    pub output_files: Vec<String>,
    pub failure: Option<FailureReason>,
}

impl JobResult {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            prompt: job.prompt().to_string(),
            attempts: job.attempt_count,
            duration_secs: job.duration_secs,
            output_files: job.output_files.clone(),
            failure: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResults {
    pub completed: Vec<JobResult>,
    pub failed: Vec<JobResult>,
    pub cancelled: usize,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    /// Cancelled when the loop task exits, however it exits.
    finished: CancellationToken,
}

pub struct Orchestrator {
    accessor: Arc<dyn RenderAccessor>,
    executor: Arc<JobExecutor>,
    queue: Arc<Mutex<JobQueue>>,
    progress: Arc<RwLock<ProgressAggregator>>,
    store: Option<Arc<dyn ResultStore>>,
    config: Arc<OrchestratorConfig>,
    pause: Arc<watch::Sender<bool>>,
    worker: Mutex<Option<Worker>>,
}

impl Orchestrator {
    pub fn new(accessor: Arc<dyn RenderAccessor>, config: OrchestratorConfig) -> Self {
        let executor = build_executor(&accessor, &config);
        let queue = JobQueue::new().with_max_consecutive_retries(config.max_consecutive_retries);
        let progress = ProgressAggregator::new(config.progress.clone());
        let (pause, _) = watch::channel(false);

        Self {
            accessor,
            executor: Arc::new(executor),
            queue: Arc::new(Mutex::new(queue)),
            progress: Arc::new(RwLock::new(progress)),
            store: None,
            config: Arc::new(config),
            pause: Arc::new(pause),
            worker: Mutex::new(None),
        }
    }

    /// Inject prompts into `template` for jobs without a full node graph.
    pub fn with_template(mut self, template: WorkflowTemplate) -> Self {
        self.executor = Arc::new(build_executor(&self.accessor, &self.config).with_template(template));
        self
    }

    /// Hand every terminal job to `store`.
    pub fn with_result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(&self) -> &Arc<Mutex<JobQueue>> {
        &self.queue
    }

    pub fn progress(&self) -> &Arc<RwLock<ProgressAggregator>> {
        &self.progress
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    // ---- queue passthrough ----

    pub async fn enqueue(&self, job: Job) -> Result<JobId, PipelineError> {
        Ok(self.queue.lock().await.enqueue(job)?)
    }

    pub async fn enqueue_prompts<I, S>(
        &self,
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
        self.queue
            .lock()
            .await
            .enqueue_prompts(prompts, workflow_type, base_params, priority, max_retries)
    }

    pub async fn cancel(&self, job_id: &str) -> bool {
        self.queue.lock().await.cancel(job_id)
    }

    // ---- lifecycle ----

    /// Spawn the processing loop.
    ///
    /// Fails if the loop is already running, nothing is pending, or the
    /// rendering service does not answer its health probe.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(PipelineError::AlreadyRunning);
        }

        let baseline = self.queue.lock().await.snapshot();
        let pending = baseline.pending;
        if pending == 0 {
            return Err(PipelineError::EmptyQueue);
        }
        if !self.executor.health_check().await {
            return Err(PipelineError::Unreachable(
                "health probe failed before start".to_string(),
            ));
        }

        self.pause.send_replace(false);
        self.progress
            .write()
            .await
            .start_with_baseline(pending, baseline);

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let ctx = LoopContext {
            accessor: Arc::clone(&self.accessor),
            executor: Arc::clone(&self.executor),
            queue: Arc::clone(&self.queue),
            progress: Arc::clone(&self.progress),
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            pause: Arc::clone(&self.pause),
            cancel: cancel.clone(),
        };
        let guard = finished.clone().drop_guard();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run_loop(ctx).await;
        });

        tracing::info!(pending, "Orchestrator started");
        *worker = Some(Worker {
            handle,
            cancel,
            finished,
        });
        Ok(())
    }

    /// Hold the loop before its next job. The current job keeps running.
    pub fn pause(&self) {
        if !self.pause.send_replace(true) {
            tracing::info!("Orchestrator paused");
        }
    }

    pub fn resume(&self) {
        if self.pause.send_replace(false) {
            tracing::info!("Orchestrator resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Cancel pending work and signal the loop to exit.
    ///
    /// With `wait`, blocks up to `stop_timeout` for the loop to finish and
    /// returns `false` if it did not. Without it the loop is only signalled
    /// and keeps counting as running until it exits. In-flight remote work
    /// is never recalled.
    pub async fn stop(&self, wait: bool) -> bool {
        let (cancel, finished) = match self.worker.lock().await.as_ref() {
            Some(w) => (w.cancel.clone(), w.finished.clone()),
            None => return true,
        };

        cancel.cancel();
        let cancelled = self.queue.lock().await.cancel_all();
        tracing::info!(cancelled, wait, "Stop requested");

        if !wait {
            return true;
        }

        if tokio::time::timeout(self.config.stop_timeout, finished.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = self.config.stop_timeout.as_secs(),
                "Orchestration loop did not exit in time",
            );
            return false;
        }

        let worker = {
            let mut slot = self.worker.lock().await;
            // A start() after the exit may already have replaced the worker.
            if slot.as_ref().is_some_and(|w| w.finished.is_cancelled()) {
                slot.take()
            } else {
                None
            }
        };
        let Some(worker) = worker else {
            return true;
        };
        match worker.handle.await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Orchestration loop panicked");
                false
            }
        }
    }

    /// Resolve once the loop task has exited (immediately if not started).
    pub async fn wait(&self) {
        let finished = self
            .worker
            .lock()
            .await
            .as_ref()
            .map(|w| w.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    // ---- reporting ----

    pub async fn get_status(&self) -> OrchestratorStatus {
        let queue = self.queue.lock().await.snapshot();
        let progress = self.progress.read().await.latest_snapshot();
        OrchestratorStatus {
            is_running: self.is_running().await,
            is_paused: self.is_paused(),
            queue,
            progress,
        }
    }

    pub async fn batch_results(&self) -> BatchResults {
        let queue = self.queue.lock().await;
        let completed: Vec<JobResult> = queue.completed_jobs().iter().map(JobResult::from_job).collect();
        let failed: Vec<JobResult> = queue.failed_jobs().iter().map(JobResult::from_job).collect();
        BatchResults {
            success_rate: success_rate(completed.len(), failed.len()),
            cancelled: queue.snapshot().cancelled,
            completed,
            failed,
        }
    }

    pub async fn add_observer(
        &self,
        observer: impl Fn(&ProgressSnapshot) + Send + Sync + 'static,
    ) -> ObserverId {
        self.progress.write().await.add_observer(observer)
    }

    pub async fn remove_observer(&self, id: ObserverId) -> bool {
        self.progress.write().await.remove_observer(id)
    }
}

fn build_executor(accessor: &Arc<dyn RenderAccessor>, config: &OrchestratorConfig) -> JobExecutor {
    let monitor = JobMonitor::with_default_detectors(
        Arc::clone(accessor),
        config.output_dir.clone(),
        config.monitor.clone(),
    );
    JobExecutor::new(Arc::clone(accessor), Arc::new(monitor), config.executor.clone())
        .with_reconnect(config.reconnect.clone())
}

// ---------------------------------------------------------------------------
// Processing loop
// ---------------------------------------------------------------------------

struct LoopContext {
    accessor: Arc<dyn RenderAccessor>,
    executor: Arc<JobExecutor>,
    queue: Arc<Mutex<JobQueue>>,
    progress: Arc<RwLock<ProgressAggregator>>,
    store: Option<Arc<dyn ResultStore>>,
    config: Arc<OrchestratorConfig>,
    pause: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

async fn run_loop(ctx: LoopContext) {
    tracing::info!("Orchestration loop started");
    let mut paused = ctx.pause.subscribe();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if *paused.borrow_and_update() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = paused.changed() => {}
                _ = tokio::time::sleep(ctx.config.pause_poll_interval) => {}
            }
            continue;
        }

        if !ctx.executor.health_check().await {
            if !hold_for_service(&ctx).await {
                break;
            }
            continue;
        }

        let next = ctx.queue.lock().await.dequeue();
        let Some(job) = next else {
            tracing::info!("Queue drained");
            break;
        };

        if !process_job(&ctx, job).await {
            break;
        }

        let has_pending = !ctx.queue.lock().await.is_empty();
        if has_pending && !sleep_or_cancel(ctx.executor.config().batch_delay, &ctx.cancel).await {
            break;
        }
    }

    publish(&ctx, None, None).await;
    ctx.progress.write().await.stop();
    tracing::info!("Orchestration loop finished");
}

/// Run one attempt of `job` and resolve it. Returns `false` when the loop
/// was cancelled.
async fn process_job(ctx: &LoopContext, mut job: Job) -> bool {
    let job_id = job.id().to_string();

    if job.attempt_count > 1 {
        let executor = ctx.executor.config();
        let delay = retry_backoff(job.attempt_count - 2, executor.backoff_base, executor.backoff_ceiling);
        tracing::info!(
            job_id = %job_id,
            attempt = job.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry",
        );
        if !sleep_or_cancel(delay, &ctx.cancel).await {
            abandon(ctx, &job_id).await;
            return false;
        }
    }

    ctx.progress.write().await.record_started(&job_id);
    publish(ctx, Some(&job_id), Some(0.0)).await;

    let queue = Arc::clone(&ctx.queue);
    let progress = Arc::clone(&ctx.progress);
    let on_tick = move |target: &DetectionTarget, status: RemoteStatus| {
        if status != RemoteStatus::Running {
            return;
        }
        // Best effort: skip the update rather than block the monitor.
        if let (Ok(queue), Ok(mut progress)) = (queue.try_lock(), progress.try_write()) {
            progress.update_progress(queue.snapshot(), Some(&target.job_id), Some(RUNNING_FRACTION));
        }
    };

    let result = ctx
        .executor
        .execute_once(&mut job, &ctx.cancel, Some(&on_tick as &TickCallback))
        .await;

    if result == Err(FailureReason::Cancelled) {
        abandon(ctx, &job_id).await;
        return false;
    }

    if let Err(reason @ FailureReason::Transport { .. }) = &result {
        return requeue_lost(ctx, &job_id, reason.clone()).await;
    }

    if result.is_ok() {
        job.output_files = discover_outputs(ctx, &job).await;
    }

    let (outcome, record) = {
        let mut queue = ctx.queue.lock().await;
        if let Err(e) = queue.record_attempt_details(&job) {
            tracing::warn!(job_id = %job_id, error = %e, "Could not record attempt details");
        }
        let outcome = queue.complete(&job_id, result);
        let record = queue.get(&job_id).cloned();
        (outcome, record)
    };

    let terminal = matches!(outcome, Ok(o) if o.is_terminal());

    match outcome {
        Ok(CompletionOutcome::Completed) => {
            ctx.progress.write().await.record_completed(&job_id);
        }
        Ok(CompletionOutcome::RetryScheduled { attempt, max }) => {
            tracing::info!(job_id = %job_id, attempt, max, "Attempt failed, job requeued");
        }
        Ok(CompletionOutcome::Failed { attempts }) => {
            tracing::warn!(job_id = %job_id, attempts, "Job failed");
            if let Some(reason) = record.as_ref().and_then(|j| j.last_error.as_ref()) {
                ctx.progress.write().await.record_failed(&job_id, reason);
            }
        }
        Err(e) => {
            // Typically the job was cancelled while it ran.
            tracing::warn!(job_id = %job_id, error = %e, "Queue rejected completion");
        }
    }

    if let (true, Some(record)) = (terminal, &record) {
        hand_off(ctx, record).await;
    }

    publish(ctx, None, None).await;
    true
}

/// Pause the loop while the rendering service is unreachable.
///
/// With `auto_resume` this waits for the service and resumes; otherwise the
/// loop stays paused until [`Orchestrator::resume`]. Returns `false` if
/// cancelled while waiting.
async fn hold_for_service(ctx: &LoopContext) -> bool {
    ctx.pause.send_replace(true);
    if !ctx.config.auto_resume {
        tracing::warn!("Rendering service unreachable, paused until resumed");
        return true;
    }
    tracing::warn!("Rendering service unreachable, paused until it answers");
    if !wait_until_reachable(ctx.accessor.as_ref(), &ctx.config.reconnect, &ctx.cancel).await {
        return false;
    }
    ctx.pause.send_replace(false);
    tracing::info!("Rendering service back, resuming");
    true
}

/// A submission that never reached the service: requeue the job without
/// charging the attempt and pause until the service is back.
async fn requeue_lost(ctx: &LoopContext, job_id: &str, reason: FailureReason) -> bool {
    let requeued = {
        let mut queue = ctx.queue.lock().await;
        // Checked under the queue lock so a concurrent stop's cancel_all
        // sees the requeued job.
        if ctx.cancel.is_cancelled() {
            None
        } else {
            Some(queue.requeue_uncounted(job_id, reason))
        }
    };

    match requeued {
        None => {
            abandon(ctx, job_id).await;
            return false;
        }
        Some(Err(e)) => {
            tracing::warn!(job_id, error = %e, "Queue rejected requeue");
        }
        Some(Ok(())) => {}
    }
    publish(ctx, None, None).await;

    ctx.pause.send_replace(true);
    if ctx.config.auto_resume
        && !sleep_or_cancel(ctx.config.reconnect.initial_delay, &ctx.cancel).await
    {
        return false;
    }
    hold_for_service(ctx).await
}

/// Cancel the job the loop was holding when a stop arrived.
async fn abandon(ctx: &LoopContext, job_id: &str) {
    let cancelled = ctx.queue.lock().await.cancel(job_id);
    if cancelled {
        ctx.progress
            .write()
            .await
            .record_failed(job_id, &FailureReason::Cancelled);
    }
    tracing::info!(job_id, "Job abandoned on stop");
}

/// Output files for a successful job: images in the output directory when
/// one is configured, otherwise the filenames the service recorded.
async fn discover_outputs(ctx: &LoopContext, job: &Job) -> Vec<String> {
    if let Some(dir) = &ctx.config.output_dir {
        return match find_output_files(dir, job.id()).await {
            Ok(paths) => paths
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                tracing::warn!(job_id = %job.id(), dir = %dir.display(), error = %e, "Output scan failed");
                Vec::new()
            }
        };
    }

    let Some(remote_id) = &job.remote_id else {
        return Vec::new();
    };
    match ctx.accessor.get_history(remote_id).await {
        Ok(Some(record)) => record.output_filenames(),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::debug!(job_id = %job.id(), error = %e, "Could not read output filenames");
            Vec::new()
        }
    }
}

async fn hand_off(ctx: &LoopContext, job: &Job) {
    let Some(store) = &ctx.store else {
        return;
    };
    if let Err(e) = store.record_terminal(job).await {
        tracing::error!(job_id = %job.id(), error = %e, "Result store rejected job");
    }
}

async fn publish(ctx: &LoopContext, current_job: Option<&str>, fraction: Option<f64>) {
    let snapshot = ctx.queue.lock().await.snapshot();
    ctx.progress
        .write()
        .await
        .update_progress(snapshot, current_job, fraction);
}
