//! Capability interface of a speech-recognition backend.

use std::path::Path;

use async_trait::async_trait;

use super::error::InferenceError;

/// One submission to the backend.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub job_id: &'a str,
    pub audio_path: &'a Path,
    /// Body of the active transcription prompt.
    pub prompt: &'a str,
}

/// Answer of a single result poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPoll {
    /// The backend is still working; carries its status message.
    InProgress(String),
    /// The finished transcript.
    Ready(Vec<u8>),
    /// The backend has no result for this job yet.
    NotFoundYet(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Hands the audio to the backend. Returns the backend's acknowledgement.
    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<String, InferenceError>;

    /// Asks once for the result of a submitted job.
    async fn fetch_result(&self, job_id: &str) -> Result<ResultPoll, InferenceError>;
}
