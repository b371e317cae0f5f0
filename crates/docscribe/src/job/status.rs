//! The job status state machine.
//!
//! ```text
//! uploading → waiting → transcribing → waiting_for_proofreading
//!     → proofreading → converting → completed
//! (any non-terminal state) → error
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploading,
    Waiting,
    Transcribing,
    WaitingForProofreading,
    Proofreading,
    Converting,
    Completed,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Uploading,
        JobStatus::Waiting,
        JobStatus::Transcribing,
        JobStatus::WaitingForProofreading,
        JobStatus::Proofreading,
        JobStatus::Converting,
        JobStatus::Completed,
        JobStatus::Error,
    ];

    /// Statuses during which a job still needs the remote compute resource.
    pub const RESOURCE_CONSUMING: [JobStatus; 4] = [
        JobStatus::Uploading,
        JobStatus::Waiting,
        JobStatus::Transcribing,
        JobStatus::WaitingForProofreading,
    ];

    pub const TERMINAL: [JobStatus; 2] = [JobStatus::Completed, JobStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploading => "uploading",
            JobStatus::Waiting => "waiting",
            JobStatus::Transcribing => "transcribing",
            JobStatus::WaitingForProofreading => "waiting_for_proofreading",
            JobStatus::Proofreading => "proofreading",
            JobStatus::Converting => "converting",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    /// The next status on the success path, or `None` for terminal states.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Uploading => Some(JobStatus::Waiting),
            JobStatus::Waiting => Some(JobStatus::Transcribing),
            JobStatus::Transcribing => Some(JobStatus::WaitingForProofreading),
            JobStatus::WaitingForProofreading => Some(JobStatus::Proofreading),
            JobStatus::Proofreading => Some(JobStatus::Converting),
            JobStatus::Converting => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Error => None,
        }
    }

    /// Whether `self → to` is an edge of the state graph.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == JobStatus::Error || self.next() == Some(to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    pub fn is_resource_consuming(&self) -> bool {
        Self::RESOURCE_CONSUMING.contains(self)
    }

    /// Position on the success path. `Error` ranks after everything.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Uploading => 0,
            JobStatus::Waiting => 1,
            JobStatus::Transcribing => 2,
            JobStatus::WaitingForProofreading => 3,
            JobStatus::Proofreading => 4,
            JobStatus::Converting => 5,
            JobStatus::Completed => 6,
            JobStatus::Error => 7,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
