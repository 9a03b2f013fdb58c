//! Status detectors: independent, best-effort probes of one job's remote state.
//!
//! Each detector turns one signal source into a [`DetectorOpinion`]. Errors
//! never escape a detector; they become a zero-confidence `Unknown` opinion
//! and are remembered as the detector's last error.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use genqueue_comfyui::accessor::RenderAccessor;
use genqueue_comfyui::messages::QueuePosition;
use genqueue_core::naming::is_output_for_job;
use genqueue_core::reconcile::{DetectorOpinion, RemoteStatus};
use genqueue_core::types::{JobId, RemoteId};

/// The job being watched: our id plus the server-assigned one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionTarget {
    pub job_id: JobId,
    pub remote_id: RemoteId,
}

impl DetectionTarget {
    pub fn new(job_id: impl Into<JobId>, remote_id: impl Into<RemoteId>) -> Self {
        Self {
            job_id: job_id.into(),
            remote_id: remote_id.into(),
        }
    }
}

/// A source of opinions about a job's remote status.
#[async_trait]
pub trait StatusDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the detector can currently produce a meaningful opinion.
    /// Unavailable detectors are skipped for the tick.
    async fn is_available(&self) -> bool;

    async fn check(&self, target: &DetectionTarget) -> DetectorOpinion;

    /// Message of the most recent swallowed error, if any.
    fn last_error(&self) -> Option<String>;
}

/// Diagnostic view of one detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub available: bool,
    pub last_error: Option<String>,
}

/// Remembers the last error a detector swallowed.
#[derive(Debug, Default)]
struct ErrorSlot(Mutex<Option<String>>);

impl ErrorSlot {
    fn set(&self, message: String) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(message);
    }

    fn get(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Looks the job up in the service's execution history.
///
/// Presence is the strongest signal available: `Completed` at 1.0, or
/// `Failed` at 0.95 when the record carries an error status.
pub struct HistoryDetector {
    accessor: Arc<dyn RenderAccessor>,
    last_error: ErrorSlot,
}

impl HistoryDetector {
    pub const NAME: &'static str = "history";

    pub fn new(accessor: Arc<dyn RenderAccessor>) -> Self {
        Self {
            accessor,
            last_error: ErrorSlot::default(),
        }
    }
}

#[async_trait]
impl StatusDetector for HistoryDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn check(&self, target: &DetectionTarget) -> DetectorOpinion {
        match self.accessor.get_history(&target.remote_id).await {
            Ok(Some(record)) if record.is_error() => DetectorOpinion::new(
                Self::NAME,
                RemoteStatus::Failed,
                0.95,
                "history records an execution error",
            ),
            Ok(Some(record)) => DetectorOpinion::new(
                Self::NAME,
                RemoteStatus::Completed,
                1.0,
                format!("{} output file(s) in history", record.output_filenames().len()),
            ),
            Ok(None) => {
                DetectorOpinion::new(Self::NAME, RemoteStatus::Unknown, 0.5, "not found in history")
            }
            Err(e) => {
                tracing::debug!(remote_id = %target.remote_id, error = %e, "History check failed");
                self.last_error.set(e.to_string());
                DetectorOpinion::unknown(Self::NAME, e.to_string())
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Looks the job up in the service's live running/pending lists.
///
/// Absence is ambiguous (finished, or never accepted) so it only yields a
/// weak `Unknown`.
pub struct QueueDetector {
    accessor: Arc<dyn RenderAccessor>,
    last_error: ErrorSlot,
}

impl QueueDetector {
    pub const NAME: &'static str = "queue";

    pub fn new(accessor: Arc<dyn RenderAccessor>) -> Self {
        Self {
            accessor,
            last_error: ErrorSlot::default(),
        }
    }
}

#[async_trait]
impl StatusDetector for QueueDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn check(&self, target: &DetectionTarget) -> DetectorOpinion {
        let queue = match self.accessor.get_queue_snapshot().await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::debug!(remote_id = %target.remote_id, error = %e, "Queue check failed");
                self.last_error.set(e.to_string());
                return DetectorOpinion::unknown(Self::NAME, e.to_string());
            }
        };

        match queue.position(&target.remote_id) {
            QueuePosition::Running => {
                DetectorOpinion::new(Self::NAME, RemoteStatus::Running, 0.9, "running")
            }
            QueuePosition::Pending(position) => DetectorOpinion::new(
                Self::NAME,
                RemoteStatus::Running,
                0.8,
                format!("pending at position {position}"),
            ),
            QueuePosition::NotQueued => {
                DetectorOpinion::new(Self::NAME, RemoteStatus::Unknown, 0.3, "not in queue")
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Scans the output directory for images named after the job.
///
/// Its `Completed` opinion (0.7) stays below the terminal threshold, so
/// files alone never end a wait.
pub struct FileDetector {
    output_dir: PathBuf,
    last_error: ErrorSlot,
}

impl FileDetector {
    pub const NAME: &'static str = "file";

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            last_error: ErrorSlot::default(),
        }
    }

    async fn count_outputs(&self, job_id: &str) -> std::io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if is_output_for_job(&name.to_string_lossy(), job_id) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl StatusDetector for FileDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.output_dir)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }

    async fn check(&self, target: &DetectionTarget) -> DetectorOpinion {
        match self.count_outputs(&target.job_id).await {
            Ok(0) => DetectorOpinion::new(Self::NAME, RemoteStatus::Unknown, 0.1, "no output files"),
            Ok(n) => DetectorOpinion::new(
                Self::NAME,
                RemoteStatus::Completed,
                0.7,
                format!("{n} output file(s) found"),
            ),
            Err(e) => {
                tracing::debug!(dir = %self.output_dir.display(), error = %e, "Output scan failed");
                self.last_error.set(e.to_string());
                DetectorOpinion::unknown(Self::NAME, e.to_string())
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }
}

/// The standard detector set: history and queue, plus the file detector
/// when an output directory is known.
pub fn default_detectors(
    accessor: Arc<dyn RenderAccessor>,
    output_dir: Option<PathBuf>,
) -> Vec<Arc<dyn StatusDetector>> {
    let mut detectors: Vec<Arc<dyn StatusDetector>> = vec![
        Arc::new(HistoryDetector::new(Arc::clone(&accessor))),
        Arc::new(QueueDetector::new(accessor)),
    ];
    if let Some(dir) = output_dir {
        detectors.push(Arc::new(FileDetector::new(dir)));
    }
    detectors
}

#[cfg(test)]
mod tests {
    use super::*;
    use genqueue_comfyui::accessor::AccessorError;
    use genqueue_comfyui::messages::{HistoryRecord, HistoryStatus, RemoteQueue};

    /// Answers every call with fixed values.
    struct StaticService {
        history: Result<Option<HistoryRecord>, AccessorError>,
        queue: Result<RemoteQueue, AccessorError>,
    }

    impl StaticService {
        fn new() -> Self {
            Self {
                history: Ok(None),
                queue: Ok(RemoteQueue::default()),
            }
        }
    }

    #[async_trait]
    impl RenderAccessor for StaticService {
        async fn is_reachable(&self) -> bool {
            true
        }

        async fn submit(&self, _workflow: &serde_json::Value) -> Result<String, AccessorError> {
            Ok("remote-1".into())
        }

        async fn get_history(&self, _id: &str) -> Result<Option<HistoryRecord>, AccessorError> {
            self.history.clone()
        }

        async fn get_queue_snapshot(&self) -> Result<RemoteQueue, AccessorError> {
            self.queue.clone()
        }
    }

    fn target() -> DetectionTarget {
        DetectionTarget::new("job-1", "remote-1")
    }

    fn history_with(service: StaticService) -> HistoryDetector {
        HistoryDetector::new(Arc::new(service))
    }

    fn queue_with(service: StaticService) -> QueueDetector {
        QueueDetector::new(Arc::new(service))
    }

    // -- history --

    #[tokio::test]
    async fn history_presence_is_completed() {
        let detector = history_with(StaticService {
            history: Ok(Some(HistoryRecord::default())),
            ..StaticService::new()
        });
        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.status, RemoteStatus::Completed);
        assert_eq!(opinion.confidence, 1.0);
    }

    #[tokio::test]
    async fn history_error_record_is_failed() {
        let record = HistoryRecord {
            status: Some(HistoryStatus {
                status_str: "error".into(),
                completed: false,
            }),
            ..Default::default()
        };
        let detector = history_with(StaticService {
            history: Ok(Some(record)),
            ..StaticService::new()
        });
        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.status, RemoteStatus::Failed);
        assert!(opinion.confidence > 0.8);
    }

    #[tokio::test]
    async fn history_absence_is_weak_unknown() {
        let opinion = history_with(StaticService::new()).check(&target()).await;
        assert_eq!(opinion.status, RemoteStatus::Unknown);
        assert_eq!(opinion.confidence, 0.5);
    }

    #[tokio::test]
    async fn history_error_is_swallowed_and_remembered() {
        let detector = history_with(StaticService {
            history: Err(AccessorError::Unreachable("connection refused".into())),
            ..StaticService::new()
        });
        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.status, RemoteStatus::Unknown);
        assert_eq!(opinion.confidence, 0.0);
        assert!(detector.last_error().unwrap().contains("connection refused"));
    }

    // -- queue --

    #[tokio::test]
    async fn queue_positions_map_to_confidence() {
        let queue = RemoteQueue {
            running: vec!["remote-1".into()],
            pending: vec!["remote-2".into(), "remote-3".into()],
        };
        let detector = queue_with(StaticService {
            queue: Ok(queue),
            ..StaticService::new()
        });

        let running = detector.check(&target()).await;
        assert_eq!((running.status, running.confidence), (RemoteStatus::Running, 0.9));

        let pending = detector.check(&DetectionTarget::new("job-3", "remote-3")).await;
        assert_eq!((pending.status, pending.confidence), (RemoteStatus::Running, 0.8));
        assert!(pending.detail.contains('1'));

        let absent = detector.check(&DetectionTarget::new("job-9", "remote-9")).await;
        assert_eq!((absent.status, absent.confidence), (RemoteStatus::Unknown, 0.3));
    }

    #[tokio::test]
    async fn queue_error_is_zero_confidence() {
        let detector = queue_with(StaticService {
            queue: Err(AccessorError::Malformed("not json".into())),
            ..StaticService::new()
        });
        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.confidence, 0.0);
        assert!(detector.last_error().is_some());
    }

    // -- file --

    #[tokio::test]
    async fn file_detector_finds_matching_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job-1_00001_.png"), b"png").unwrap();
        std::fs::write(dir.path().join("job-1.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("job-2_00001_.png"), b"png").unwrap();

        let detector = FileDetector::new(dir.path());
        assert!(detector.is_available().await);

        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.status, RemoteStatus::Completed);
        assert_eq!(opinion.confidence, 0.7);
        assert_eq!(opinion.detail, "1 output file(s) found");

        let none = detector.check(&DetectionTarget::new("job-7", "r")).await;
        assert_eq!((none.status, none.confidence), (RemoteStatus::Unknown, 0.1));
    }

    #[tokio::test]
    async fn file_detector_unavailable_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let detector = FileDetector::new(dir.path().join("missing"));
        assert!(!detector.is_available().await);

        let opinion = detector.check(&target()).await;
        assert_eq!(opinion.confidence, 0.0);
        assert!(detector.last_error().is_some());
    }

    #[test]
    fn default_set_adds_file_detector_only_with_dir() {
        let accessor: Arc<dyn RenderAccessor> = Arc::new(StaticService::new());
        let names = |ds: Vec<Arc<dyn StatusDetector>>| ds.iter().map(|d| d.name()).collect::<Vec<_>>();

        assert_eq!(names(default_detectors(Arc::clone(&accessor), None)), ["history", "queue"]);
        assert_eq!(
            names(default_detectors(accessor, Some(PathBuf::from("/tmp")))),
            ["history", "queue", "file"]
        );
    }
}
