//! The job record and its stages.

mod status;

pub use status::{JobStatus, UnknownStatus};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::{parse_timestamp, DatabaseError};

/// A pipeline stage that produces an artifact and may use a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcribe,
    Proofread,
    Convert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcribe => "transcribe",
            Stage::Proofread => "proofread",
            Stage::Convert => "convert",
        }
    }

    /// The status a job holds while this stage runs.
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Transcribe => JobStatus::Transcribing,
            Stage::Proofread => JobStatus::Proofreading,
            Stage::Convert => JobStatus::Converting,
        }
    }

    pub fn artifact(&self) -> ArtifactKind {
        match self {
            Stage::Transcribe => ArtifactKind::Transcript,
            Stage::Proofread => ArtifactKind::Proofread,
            Stage::Convert => ArtifactKind::Document,
        }
    }

    /// Column holding the prompt version this stage used, if it takes a prompt.
    pub(crate) fn prompt_column(&self) -> Option<&'static str> {
        match self {
            Stage::Transcribe => Some("transcribe_prompt_version"),
            Stage::Proofread => Some("proofread_prompt_version"),
            Stage::Convert => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(Stage::Transcribe),
            "proofread" => Ok(Stage::Proofread),
            "convert" => Ok(Stage::Convert),
            other => Err(format!(
                "unknown stage '{}' (expected transcribe, proofread or convert)",
                other
            )),
        }
    }
}

/// Kinds of artifact a job produces, one per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Transcript,
    Proofread,
    Document,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Transcript => "transcript",
            ArtifactKind::Proofread => "proofread",
            ArtifactKind::Document => "document",
        }
    }

    /// The status in which this artifact may be recorded.
    pub fn producing_status(&self) -> JobStatus {
        match self {
            ArtifactKind::Transcript => JobStatus::Transcribing,
            ArtifactKind::Proofread => JobStatus::Proofreading,
            ArtifactKind::Document => JobStatus::Converting,
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            ArtifactKind::Transcript => "transcript_path",
            ArtifactKind::Proofread => "proofread_path",
            ArtifactKind::Document => "document_path",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcript" => Ok(ArtifactKind::Transcript),
            "proofread" => Ok(ArtifactKind::Proofread),
            "document" => Ok(ArtifactKind::Document),
            other => Err(format!(
                "unknown artifact '{}' (expected transcript, proofread or document)",
                other
            )),
        }
    }
}

/// Artifact locations, each set once by the stage that produces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proofread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl ArtifactPaths {
    pub fn get(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Transcript => self.transcript.as_deref(),
            ArtifactKind::Proofread => self.proofread.as_deref(),
            ArtifactKind::Document => self.document.as_deref(),
        }
    }
}

/// Prompt versions captured when each stage called its backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromptVersions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribe: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proofread: Option<i64>,
}

/// One audio-to-document request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub owner_ref: String,
    pub source_ref: String,
    pub status: JobStatus,
    pub artifact_paths: ArtifactPaths,
    pub prompt_versions: PromptVersions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn has_artifact(&self, kind: ArtifactKind) -> bool {
        self.artifact_paths.get(kind).is_some()
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| DatabaseError::Corrupt {
                column: "status",
                value: e.0,
            })?;

        Ok(Job {
            id: row.id,
            owner_ref: row.owner_ref,
            source_ref: row.source_ref,
            status,
            artifact_paths: ArtifactPaths {
                transcript: row.transcript_path,
                proofread: row.proofread_path,
                document: row.document_path,
            },
            prompt_versions: PromptVersions {
                transcribe: row.transcribe_prompt_version,
                proofread: row.proofread_prompt_version,
            },
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
        })
    }
}
