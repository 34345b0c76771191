//! File-backed job record store: one pretty-printed JSON document per job id
//! in the results directory, next to the result arrays it describes.
//!
//! Updates are read-modify-write without cross-process locking. The races
//! this admits are bounded by design: during a run only the task runner
//! writes lifecycle fields, while request handlers only patch idempotent
//! reconciliation fields, so a lost update is benign (last writer wins).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::job::{JobRecord, JobStatus, JobUpdate, ABORTED_BY_USER};
use crate::queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct JobStore {
    results_dir: PathBuf,
    inputs_dir: PathBuf,
}

impl JobStore {
    pub fn new(results_dir: PathBuf, inputs_dir: PathBuf) -> Self {
        Self {
            results_dir,
            inputs_dir,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn inputs_dir(&self) -> &Path {
        &self.inputs_dir
    }

    pub fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.results_dir.join(format!("{job_id}.json"))
    }

    pub fn result_path(&self, job_id: &str) -> PathBuf {
        self.results_dir.join(format!("{job_id}.npy"))
    }

    pub fn input_path(&self, job_id: &str, filename: &str) -> PathBuf {
        self.inputs_dir.join(format!("{job_id}_{filename}"))
    }

    pub fn ensure_io_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.inputs_dir).with_context(|| {
            format!(
                "failed to create inputs directory: {}",
                self.inputs_dir.display()
            )
        })?;
        fs::create_dir_all(&self.results_dir).with_context(|| {
            format!(
                "failed to create results directory: {}",
                self.results_dir.display()
            )
        })?;
        Ok(())
    }

    pub fn save(&self, job: &JobRecord) -> Result<()> {
        fs::create_dir_all(&self.results_dir).with_context(|| {
            format!(
                "failed to create results directory: {}",
                self.results_dir.display()
            )
        })?;

        let path = self.metadata_path(&job.id);
        let payload = serde_json::to_string_pretty(job)
            .with_context(|| format!("failed to serialize job record {}", job.id))?;
        fs::write(&path, payload)
            .with_context(|| format!("failed to write job record: {}", path.display()))?;
        Ok(())
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.metadata_path(job_id).exists()
    }

    pub fn load(&self, job_id: &str) -> Result<JobRecord> {
        let path = self.metadata_path(job_id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read job record: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse job record: {}", path.display()))
    }

    /// Apply a partial update via read-modify-write. A missing record is a
    /// silent no-op (the job may have been deleted underneath a worker).
    /// Status changes are validated against the state machine and the cancel
    /// flag is sticky: once raised it can never be cleared.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<()> {
        if !self.exists(job_id) {
            return Ok(());
        }
        let mut job = self.load(job_id)?;

        if let Some(next) = update.status {
            anyhow::ensure!(
                job.status.can_transition_to(next),
                "illegal status transition for job {job_id}: {} -> {}",
                job.status.as_str(),
                next.as_str()
            );
            job.status = next;
        }
        if let Some(shape) = update.result_shape {
            job.result_shape = Some(shape);
        }
        if let Some(dataset) = update.result_dataset {
            job.result_dataset = dataset;
        }
        if let Some(error) = update.error {
            job.error = error;
        }
        if let Some(messages) = update.log_messages {
            job.log_messages = messages;
        }
        if let Some(task_id) = update.queue_task_id {
            job.queue_task_id = Some(task_id);
        }
        if let Some(flag) = update.cancel_requested {
            job.cancel_requested = job.cancel_requested || flag;
        }

        self.save(&job)
    }

    /// Every parseable record in the results directory. Malformed or
    /// partially-written files are skipped, never fatal.
    pub fn list_all(&self) -> Result<Vec<JobRecord>> {
        if !self.results_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.results_dir).with_context(|| {
            format!(
                "failed to read results directory: {}",
                self.results_dir.display()
            )
        })?;

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable job record");
                    continue;
                }
            };
            match serde_json::from_str::<JobRecord>(&raw) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping malformed job record");
                }
            }
        }
        Ok(jobs)
    }

    /// Remove the metadata record plus the result array and every input file
    /// stored under this id. Missing files are not errors.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        remove_file_if_present(&self.metadata_path(job_id))?;
        remove_file_if_present(&self.result_path(job_id))?;

        if self.inputs_dir.exists() {
            let prefix = format!("{job_id}_");
            let entries = fs::read_dir(&self.inputs_dir).with_context(|| {
                format!(
                    "failed to read inputs directory: {}",
                    self.inputs_dir.display()
                )
            })?;
            for entry in entries.flatten() {
                let is_input_of_job = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix));
                if is_input_of_job {
                    remove_file_if_present(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Overwrite the derived availability flags from filesystem presence.
    pub fn annotate_availability(&self, mut job: JobRecord) -> JobRecord {
        job.input_available = self.input_path(&job.id, &job.input_filename).exists();
        job.result_available = self.result_path(&job.id).exists();
        job
    }

    /// Lazy reconciliation of the revoke race: a job still recorded as queued
    /// whose queue task was revoked never ran and never will, so flip it to
    /// canceled on this read path rather than waiting for a runner that will
    /// not come. Shared by the list, detail, abort, and delete paths.
    pub fn reconcile_revoked(&self, job: JobRecord, queue: &TaskQueue) -> Result<JobRecord> {
        let revoked = match (&job.status, &job.queue_task_id) {
            (JobStatus::Queued, Some(task_id)) => queue.is_revoked(task_id)?,
            _ => false,
        };
        if !revoked {
            return Ok(job);
        }

        self.update(
            &job.id,
            JobUpdate {
                status: Some(JobStatus::Canceled),
                error: Some(Some(ABORTED_BY_USER.to_string())),
                cancel_requested: Some(true),
                ..Default::default()
            },
        )?;
        self.load(&job.id)
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove file: {}", path.display()))
        }
    }
}
