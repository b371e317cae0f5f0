//! In-process stream of committed job changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{ArtifactKind, JobStatus};

/// One committed change to a job. Sent only after the write succeeded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    /// Status after the change.
    pub status: JobStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactKind>,
    /// Failure message, only on the event that moved the job to `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    fn new(job_id: &str, status: JobStatus, message: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            message,
            timestamp: Utc::now(),
            artifact: None,
            error: None,
        }
    }

    pub fn status(job_id: &str, status: JobStatus) -> Self {
        Self::new(job_id, status, describe(status).to_string())
    }

    pub fn artifact(job_id: &str, status: JobStatus, kind: ArtifactKind) -> Self {
        Self {
            artifact: Some(kind),
            ..Self::new(job_id, status, format!("Stored {} artifact", kind))
        }
    }

    pub fn failed(job_id: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(job_id, JobStatus::Error, describe(JobStatus::Error).to_string())
        }
    }
}

fn describe(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Uploading => "Receiving source audio",
        JobStatus::Waiting => "Waiting for the inference slot",
        JobStatus::Transcribing => "Transcribing",
        JobStatus::WaitingForProofreading => "Transcript ready",
        JobStatus::Proofreading => "Proofreading",
        JobStatus::Converting => "Converting to document",
        JobStatus::Completed => "Document ready",
        JobStatus::Error => "Processing failed",
    }
}

/// Fan-out of [`JobProgressEvent`]s. Slow subscribers lag and skip events;
/// the job store stays the source of truth.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobProgressEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
