//! Job store with persistent database storage.
//!
//! Every write here commits before the call returns, so a reader in another
//! process observes exactly the states a job has reached. Status writes are
//! compare-and-set against the status the caller last saw.

mod error;

pub use error::StoreError;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{
    error_log_repo, format_timestamp, lease_repo, parse_timestamp, prompt_repo, settings_repo,
    Database,
};
use crate::job::{ArtifactKind, Job, JobStatus, Stage};

/// Settings key for the shared "remote resource is running" flag.
const RESOURCE_RUNNING_KEY: &str = "resource_running";

fn active_prompt_key(stage: Stage) -> String {
    format!("active_{}_prompt_id", stage.as_str())
}

fn now() -> String {
    format_timestamp(Utc::now())
}

fn status_strs(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

/// One recorded job failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLog {
    pub id: i64,
    pub job_id: String,
    pub message: String,
    pub stack_trace: String,
    pub created_at: DateTime<Utc>,
}

impl From<error_log_repo::ErrorLogRow> for ErrorLog {
    fn from(row: error_log_repo::ErrorLogRow) -> Self {
        Self {
            id: row.id,
            job_id: row.job_id,
            message: row.message,
            stack_trace: row.stack_trace,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

/// A versioned prompt body for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct Prompt {
    pub id: i64,
    pub stage: Stage,
    pub version: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A page of jobs plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

/// Persistent job records, error logs, prompts and shared lease state.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    progress: Option<JobProgressBroadcaster>,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db, progress: None }
    }

    /// Publishes every committed status change to `progress`.
    pub fn with_progress(mut self, progress: JobProgressBroadcaster) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn emit(&self, event: JobProgressEvent) {
        if let Some(ref progress) = self.progress {
            progress.send(event);
        }
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    /// Creates a job in `uploading`.
    pub fn create_job(&self, owner_ref: &str, source_ref: &str) -> Result<Job, StoreError> {
        let ts = now();
        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            owner_ref: owner_ref.to_string(),
            source_ref: source_ref.to_string(),
            status: JobStatus::Uploading.as_str().to_string(),
            transcript_path: None,
            proofread_path: None,
            document_path: None,
            transcribe_prompt_version: None,
            proofread_prompt_version: None,
            created_at: ts.clone(),
            updated_at: ts,
            completed_at: None,
        };
        job_repo::insert(&self.db, &row)?;
        log::info!("Created job {} for owner {}", row.id, row.owner_ref);

        let job = Job::try_from(row)?;
        self.emit(JobProgressEvent::status(&job.id, job.status));
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match job_repo::find_by_id(&self.db, id)? {
            Some(row) => Ok(Some(Job::try_from(row)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing job is an error.
    pub fn require(&self, id: &str) -> Result<Job, StoreError> {
        self.get(id)?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }

    /// Jobs owned by `owner_ref`, newest first, optionally in one status.
    pub fn list_by_owner(
        &self,
        owner_ref: &str,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<JobPage, StoreError> {
        let filter = JobFilter {
            owner_ref: Some(owner_ref.to_string()),
            status: status.map(|s| s.as_str().to_string()),
            limit,
            offset,
        };
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage { jobs, total })
    }

    /// Jobs that have not reached `completed` or `error`, oldest first.
    pub fn list_non_terminal(&self) -> Result<Vec<Job>, StoreError> {
        let statuses: Vec<JobStatus> = JobStatus::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect();
        let rows = job_repo::list_by_statuses(&self.db, &status_strs(&statuses))?;
        Ok(rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of jobs still needing the remote compute resource.
    pub fn count_active_resource_jobs(&self) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_statuses(
            &self.db,
            &status_strs(&JobStatus::RESOURCE_CONSUMING),
        )?)
    }

    /// Moves a job to `to` along an edge of the state graph.
    ///
    /// Re-entering the current status is a no-op, which keeps stage handlers
    /// idempotent when an interrupted job is resumed.
    pub fn transition(&self, id: &str, to: JobStatus) -> Result<Job, StoreError> {
        let job = self.require(id)?;
        if job.status == to {
            return Ok(job);
        }
        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to,
            });
        }

        let ts = now();
        let completed_at = (to == JobStatus::Completed).then_some(ts.as_str());
        let applied = job_repo::compare_and_set_status(
            &self.db,
            id,
            job.status.as_str(),
            to.as_str(),
            &ts,
            completed_at,
        )?;
        if !applied {
            let current = self.require(id)?;
            return Err(StoreError::InvalidTransition {
                job_id: id.to_string(),
                from: current.status,
                to,
            });
        }

        log::debug!("Job {} {} -> {}", id, job.status, to);
        self.emit(JobProgressEvent::status(id, to));
        self.require(id)
    }

    /// Records an artifact path. Allowed once, while the producing stage runs.
    ///
    /// Recording the same path twice is accepted.
    pub fn set_artifact(&self, id: &str, kind: ArtifactKind, path: &str) -> Result<(), StoreError> {
        let required = kind.producing_status();
        let applied = job_repo::set_artifact_once(
            &self.db,
            id,
            kind.column(),
            path,
            required.as_str(),
            &now(),
        )?;
        if applied {
            self.emit(JobProgressEvent::artifact(id, required, kind));
            return Ok(());
        }

        let job = self.require(id)?;
        match job.artifact_paths.get(kind) {
            Some(existing) if existing == path => Ok(()),
            Some(existing) => Err(StoreError::ArtifactAlreadySet {
                job_id: id.to_string(),
                kind,
                existing: existing.to_string(),
            }),
            None => Err(StoreError::ArtifactOutOfStage {
                job_id: id.to_string(),
                kind,
                status: job.status,
            }),
        }
    }

    /// Records the prompt version a stage used for this job.
    pub fn set_prompt_version(&self, id: &str, stage: Stage, version: i64) -> Result<(), StoreError> {
        let column = stage.prompt_column().ok_or(StoreError::NoPromptStage(stage))?;
        if !job_repo::set_prompt_version(&self.db, id, column, version, &now())? {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Marks a job as failed and records one error log, in one transaction.
    ///
    /// Returns `false` (and records nothing) when the job already reached a
    /// terminal status.
    pub fn fail_job(&self, id: &str, message: &str, stack_trace: &str) -> Result<bool, StoreError> {
        let ts = now();
        let terminal = status_strs(&JobStatus::TERMINAL);
        let recorded = self.db.with_transaction(|tx| {
            if !job_repo::mark_error_in(tx, id, JobStatus::Error.as_str(), &terminal, &ts)? {
                return Ok(false);
            }
            error_log_repo::insert_in(tx, id, message, stack_trace, &ts)?;
            Ok(true)
        })?;

        if recorded {
            log::warn!("Job {} failed: {}", id, message);
            self.emit(JobProgressEvent::failed(id, message));
        }
        Ok(recorded)
    }

    pub fn error_logs_for(&self, id: &str) -> Result<Vec<ErrorLog>, StoreError> {
        Ok(error_log_repo::list_for_job(&self.db, id)?
            .into_iter()
            .map(ErrorLog::from)
            .collect())
    }

    pub fn recent_error_logs(&self, limit: u64) -> Result<Vec<ErrorLog>, StoreError> {
        Ok(error_log_repo::list_recent(&self.db, limit)?
            .into_iter()
            .map(ErrorLog::from)
            .collect())
    }

    // ─── Prompts ────────────────────────────────────────────────────────────

    /// Stores `body` as the next prompt version for `stage`.
    pub fn add_prompt(&self, stage: Stage, body: &str) -> Result<Prompt, StoreError> {
        if stage.prompt_column().is_none() {
            return Err(StoreError::NoPromptStage(stage));
        }
        let row = prompt_repo::insert_next_version(&self.db, stage.as_str(), body, &now())?;
        Ok(Prompt {
            id: row.id,
            stage,
            version: row.version,
            body: row.body,
            created_at: parse_timestamp(&row.created_at),
        })
    }

    /// Makes prompt `prompt_id` the active one for `stage`.
    pub fn activate_prompt(&self, stage: Stage, prompt_id: i64) -> Result<(), StoreError> {
        match prompt_repo::find_by_id(&self.db, prompt_id)? {
            Some(row) if row.stage == stage.as_str() => {
                settings_repo::set(&self.db, &active_prompt_key(stage), &prompt_id.to_string())?;
                log::info!(
                    "Activated {} prompt {} (version {})",
                    stage,
                    prompt_id,
                    row.version
                );
                Ok(())
            }
            _ => Err(StoreError::UnknownPrompt {
                stage,
                id: prompt_id,
            }),
        }
    }

    /// The prompt currently active for `stage`, read fresh.
    pub fn active_prompt(&self, stage: Stage) -> Result<Prompt, StoreError> {
        let raw = settings_repo::get(&self.db, &active_prompt_key(stage))?
            .ok_or(StoreError::PromptNotSet(stage))?;
        let id: i64 = raw.trim().parse().map_err(|_| StoreError::PromptNotFound(stage))?;
        let row = prompt_repo::find_by_id(&self.db, id)?
            .filter(|row| row.stage == stage.as_str())
            .ok_or(StoreError::PromptNotFound(stage))?;
        Ok(Prompt {
            id: row.id,
            stage,
            version: row.version,
            body: row.body,
            created_at: parse_timestamp(&row.created_at),
        })
    }

    // ─── Shared resource state ──────────────────────────────────────────────

    /// Reads the shared "resource running" flag without caching.
    pub fn resource_running(&self) -> Result<bool, StoreError> {
        Ok(settings_repo::get(&self.db, RESOURCE_RUNNING_KEY)?.as_deref() == Some("true"))
    }

    /// Sets the flag to `new` only if it currently holds `expected`.
    pub fn compare_and_set_running(&self, expected: bool, new: bool) -> Result<bool, StoreError> {
        Ok(settings_repo::compare_and_set(
            &self.db,
            RESOURCE_RUNNING_KEY,
            bool_str(expected),
            bool_str(new),
        )?)
    }

    pub fn set_running(&self, running: bool) -> Result<(), StoreError> {
        Ok(settings_repo::set(
            &self.db,
            RESOURCE_RUNNING_KEY,
            bool_str(running),
        )?)
    }

    // ─── Leases ─────────────────────────────────────────────────────────────

    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(lease_repo::try_acquire(
            &self.db,
            name,
            holder,
            &format_timestamp(now),
            &format_timestamp(expiry(now, ttl)),
        )?)
    }

    pub fn renew_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(lease_repo::renew(
            &self.db,
            name,
            holder,
            &format_timestamp(expiry(Utc::now(), ttl)),
        )?)
    }

    pub fn release_lease(&self, name: &str, holder: &str) -> Result<bool, StoreError> {
        Ok(lease_repo::release(&self.db, name, holder)?)
    }

    /// Current holder of a lease, if it has one that has not expired.
    pub fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError> {
        let now = format_timestamp(Utc::now());
        Ok(lease_repo::get(&self.db, name)?.and_then(|row| match (row.holder, row.expires_at) {
            (Some(holder), Some(expires_at)) if expires_at >= now => Some(holder),
            _ => None,
        }))
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}
