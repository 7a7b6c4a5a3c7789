//! Job store — the `{version, jobs}` file behind the scheduler.
//!
//! Records are held in memory and the whole file is replaced atomically on
//! every mutation. Unlike the inbox, a failed write is surfaced to the caller:
//! a job the user just created must not silently vanish on restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::job::{CronJob, ExecutionResult, JobUpdate};
use crate::error::JobError;
use crate::persist;

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobFile {
    version: u32,
    jobs: Vec<CronJob>,
}

impl Default for JobFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            jobs: Vec::new(),
        }
    }
}

/// Persistent collection of scheduled jobs.
pub struct JobStore {
    path: PathBuf,
    file: Mutex<JobFile>,
}

impl JobStore {
    /// Load the store at `path`. A missing file is an empty store; an
    /// unreadable one is an error so it never gets overwritten.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, JobError> {
        let path = path.into();
        let file = persist::read_json::<JobFile>(&path)
            .await
            .map_err(|e| JobError::Store {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .unwrap_or_default();

        if file.version > STORE_VERSION {
            tracing::warn!(
                path = %path.display(),
                version = file.version,
                "Job store written by a newer version"
            );
        }
        tracing::debug!(jobs = file.jobs.len(), "Loaded job store");

        Ok(Arc::new(Self {
            path,
            file: Mutex::new(file),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a job and persist. Returns its id.
    pub async fn add(&self, job: CronJob) -> Result<String, JobError> {
        let mut file = self.file.lock().await;
        let id = job.id.clone();
        file.jobs.push(job);
        self.persist(&file).await?;
        tracing::info!(job_id = %id, "Job added");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<CronJob> {
        self.file
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    /// All jobs in insertion order.
    pub async fn list(&self) -> Vec<CronJob> {
        self.file.lock().await.jobs.clone()
    }

    /// Apply an explicit update and persist. Returns the updated job.
    pub async fn update(
        &self,
        id: &str,
        update: JobUpdate,
        now_ms: i64,
    ) -> Result<CronJob, JobError> {
        self.mutate(id, |job| {
            update
                .apply(job, now_ms)
                .map_err(|source| JobError::InvalidSchedule {
                    id: id.to_string(),
                    source,
                })
        })
        .await
    }

    /// Delete a job. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool, JobError> {
        let mut file = self.file.lock().await;
        let before = file.jobs.len();
        file.jobs.retain(|j| j.id != id);
        if file.jobs.len() == before {
            return Ok(false);
        }
        self.persist(&file).await?;
        tracing::info!(job_id = %id, "Job removed");
        Ok(true)
    }

    /// Record an execution outcome and rearm or retire the job.
    pub async fn record_run(
        &self,
        id: &str,
        result: &ExecutionResult,
        now_ms: i64,
    ) -> Result<CronJob, JobError> {
        self.mutate(id, |job| {
            job.apply_run(result, now_ms);
            Ok(())
        })
        .await
    }

    /// Enabled jobs due at `now_ms`.
    pub async fn due(&self, now_ms: i64) -> Vec<CronJob> {
        self.file
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.is_due(now_ms))
            .cloned()
            .collect()
    }

    /// Rewrite several jobs under one lock and one write.
    pub(crate) async fn mutate_all<F>(&self, mut f: F) -> Result<usize, JobError>
    where
        F: FnMut(&mut CronJob) -> bool,
    {
        let mut file = self.file.lock().await;
        let changed = file.jobs.iter_mut().map(&mut f).filter(|c| *c).count();
        if changed > 0 {
            self.persist(&file).await?;
        }
        Ok(changed)
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<CronJob, JobError>
    where
        F: FnOnce(&mut CronJob) -> Result<(), JobError>,
    {
        let mut file = self.file.lock().await;
        let job = file
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        f(job)?;
        let updated = job.clone();
        self.persist(&file).await?;
        Ok(updated)
    }

    async fn persist(&self, file: &JobFile) -> Result<(), JobError> {
        persist::write_json_atomic(&self.path, file)
            .await
            .map_err(|e| JobError::Store {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }
}
