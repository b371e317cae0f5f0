//! Job store error types.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{Classify, ErrorClass};
use crate::job::{ArtifactKind, JobStatus, Stage};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} cannot record its {kind} artifact while {status}")]
    ArtifactOutOfStage {
        job_id: String,
        kind: ArtifactKind,
        status: JobStatus,
    },

    #[error("Job {job_id} already has a {kind} artifact at '{existing}'")]
    ArtifactAlreadySet {
        job_id: String,
        kind: ArtifactKind,
        existing: String,
    },

    #[error("No active {0} prompt set")]
    PromptNotSet(Stage),

    #[error("Active {0} prompt not found")]
    PromptNotFound(Stage),

    #[error("Prompt {id} does not exist for stage {stage}")]
    UnknownPrompt { stage: Stage, id: i64 },

    #[error("The {0} stage does not take a prompt")]
    NoPromptStage(Stage),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Database(DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}
