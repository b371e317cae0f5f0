//! Consumer-facing job operations.
//!
//! Every lookup is scoped to the caller's owner reference. A job that exists
//! but belongs to someone else is reported as not found.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::error::{StorageError, WorkerError};
use crate::job::{ArtifactKind, Job, JobStatus};
use crate::pipeline::RunOutcome;
use crate::store::{ErrorLog, JobPage, JobStore, StoreError};
use crate::worker::TaskRunner;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} has no {kind} artifact yet (status: {status})")]
    ArtifactNotReady {
        job_id: String,
        kind: ArtifactKind,
        status: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// What the submitter gets back immediately.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub id: String,
    pub status: JobStatus,
}

/// A downloaded artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

pub struct JobService {
    runner: Arc<TaskRunner>,
    store: JobStore,
}

impl JobService {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        let store = runner.pipeline().context().store.clone();
        Self { runner, store }
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Creates the job and hands it to the task runner. Does not wait for
    /// any stage.
    pub fn submit(&self, owner_ref: &str, source_ref: &str) -> Result<SubmittedJob, ServiceError> {
        let (job, _handle) = self.submit_tracked(owner_ref, source_ref)?;
        Ok(SubmittedJob {
            id: job.id,
            status: job.status,
        })
    }

    /// Like [`submit`](Self::submit), also returning the pipeline's handle.
    pub fn submit_tracked(
        &self,
        owner_ref: &str,
        source_ref: &str,
    ) -> Result<(Job, JoinHandle<RunOutcome>), ServiceError> {
        Ok(self.runner.submit(owner_ref, source_ref)?)
    }

    pub fn status(&self, owner_ref: &str, job_id: &str) -> Result<Job, ServiceError> {
        match self.store.get(job_id)? {
            Some(job) if job.owner_ref == owner_ref => Ok(job),
            _ => Err(ServiceError::NotFound(job_id.to_string())),
        }
    }

    pub fn list(
        &self,
        owner_ref: &str,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<JobPage, ServiceError> {
        Ok(self.store.list_by_owner(owner_ref, status, limit, offset)?)
    }

    pub fn artifact(
        &self,
        owner_ref: &str,
        job_id: &str,
        kind: ArtifactKind,
    ) -> Result<Artifact, ServiceError> {
        let job = self.status(owner_ref, job_id)?;
        let path = job
            .artifact_paths
            .get(kind)
            .map(PathBuf::from)
            .ok_or_else(|| ServiceError::ArtifactNotReady {
                job_id: job.id.clone(),
                kind,
                status: job.status,
            })?;
        let content = self.runner.pipeline().context().artifacts.read(&path)?;
        Ok(Artifact { path, content })
    }

    /// Cancels a running job owned by `owner_ref`. Returns `false` when the
    /// job is not running in this process.
    pub fn cancel(&self, owner_ref: &str, job_id: &str) -> Result<bool, ServiceError> {
        self.status(owner_ref, job_id)?;
        Ok(self.runner.cancel(job_id))
    }

    pub fn error_logs(&self, limit: u64) -> Result<Vec<ErrorLog>, ServiceError> {
        Ok(self.store.recent_error_logs(limit)?)
    }

    pub fn error_logs_for(&self, owner_ref: &str, job_id: &str) -> Result<Vec<ErrorLog>, ServiceError> {
        self.status(owner_ref, job_id)?;
        Ok(self.store.error_logs_for(job_id)?)
    }

    pub fn active_jobs(&self) -> Result<u64, ServiceError> {
        Ok(self.store.count_active_resource_jobs()?)
    }
}
