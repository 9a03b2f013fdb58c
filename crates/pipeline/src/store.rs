//! Result hand-off: output-file discovery and the terminal-job sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use genqueue_core::job::Job;
use genqueue_core::naming::is_output_for_job;
use genqueue_core::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Result store backend error: {0}")]
    Backend(String),
}

/// Receives every job that reaches a terminal status.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn record_terminal(&self, job: &Job) -> Result<(), StoreError>;
}

/// Keeps terminal jobs in memory, keyed by id. Later records replace
/// earlier ones.
#[derive(Default)]
pub struct MemoryResultStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// All recorded jobs, oldest completion first.
    pub async fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.completed_at);
        jobs
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn record_terminal(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs
            .write()
            .await
            .insert(job.id().to_string(), job.clone());
        Ok(())
    }
}

/// Image files in `dir` whose name contains `job_id`, newest first.
pub async fn find_output_files(dir: &Path, job_id: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !is_output_for_job(&entry.file_name().to_string_lossy(), job_id) {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, entry.path()));
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn touch(path: &Path, modified: SystemTime) {
        let file = std::fs::File::create(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[tokio::test]
    async fn output_files_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        touch(&dir.path().join("job-1_00001_.png"), base);
        touch(&dir.path().join("job-1_00002_.png"), base + Duration::from_secs(10));
        touch(&dir.path().join("job-1_notes.txt"), base + Duration::from_secs(20));
        touch(&dir.path().join("job-2_00001_.png"), base + Duration::from_secs(30));
        std::fs::create_dir(dir.path().join("job-1.png")).unwrap();

        let files = find_output_files(dir.path(), "job-1").await.unwrap();
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["job-1_00002_.png", "job-1_00001_.png"]);
    }

    #[tokio::test]
    async fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_output_files(&dir.path().join("nope"), "job-1").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_replaces_by_id() {
        let store = MemoryResultStore::new();
        let mut job = Job::new("job-1", "p");
        store.record_terminal(&job).await.unwrap();
        job.output_files.push("job-1_00001_.png".into());
        store.record_terminal(&job).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("job-1").await.unwrap().output_files.len(), 1);
        assert!(store.get("job-2").await.is_none());
    }
}
