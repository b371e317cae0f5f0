//! Inference client error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Classify, ErrorClass};
use crate::lease::LeaseError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 400 with a structured `{error}` body.
    #[error("Inference API Error: {0}")]
    Rejected(String),

    #[error("API Error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Audio file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to read audio file '{path}': {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcription still processing: {0}")]
    StillProcessing(String),

    #[error("transcription result not found after {attempts} polls: {detail}")]
    ResultNotFound { attempts: u32, detail: String },

    #[error("inference submit gave up after {attempts} attempts: {last}")]
    SubmitGaveUp {
        attempts: u32,
        #[source]
        last: Box<InferenceError>,
    },

    #[error("result polling gave up after {attempts} failures: {last}")]
    PollGaveUp {
        attempts: u32,
        #[source]
        last: Box<InferenceError>,
    },

    #[error("gave up waiting for the inference slot after {attempts} attempts")]
    SlotUnavailable { attempts: u32 },

    #[error("inference slot was taken over by another holder")]
    SlotLost,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("inference cancelled")]
    Cancelled,
}

/// Statuses that point at the request or the deployment rather than the
/// backend's current health. Retrying them only repeats the failure.
const PERMANENT_STATUSES: &[u16] = &[401, 403, 404, 405, 413, 415, 422];

impl Classify for InferenceError {
    fn class(&self) -> ErrorClass {
        match self {
            InferenceError::Transport(_)
            | InferenceError::StillProcessing(_)
            | InferenceError::SlotLost => ErrorClass::Transient,
            // A 400 that carried a structured `{error}` is `Rejected`; a bare
            // one usually comes from a proxy in front of the backend.
            InferenceError::Status { status, .. } if !PERMANENT_STATUSES.contains(status) => {
                ErrorClass::Transient
            }
            InferenceError::Store(e) => e.class(),
            InferenceError::Lease(e) => e.class(),
            _ => ErrorClass::Permanent,
        }
    }
}
