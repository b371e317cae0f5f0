//! Audio-to-document job pipeline.
//!
//! A submitted job is transcribed by a remote speech backend (optionally on
//! a leased GPU worker), proofread chunk by chunk through an LLM, and
//! converted to a document. Every stage boundary is committed to the job
//! store so an interrupted job resumes where it stopped.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod http;
pub mod inference;
pub mod job;
pub mod lease;
pub mod logging;
pub mod pipeline;
pub mod proofread;
pub mod retry;
pub mod sanitize;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod store;
#[cfg(test)]
mod testing;
pub mod worker;

pub use app::App;
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, resolve_config_path, Config};
pub use error::{
    Classify, ConfigError, DocscribeError, ErrorClass, Result, StorageError, WorkerError,
};
pub use job::{ArtifactKind, Job, JobStatus, Stage};
pub use logging::LogFormat;
pub use pipeline::{Pipeline, PipelineContext, RunCancellation, RunOutcome};
pub use retry::{Backoff, RetryPolicy};
pub use secrets::{resolve_secret, SecretError, SecretSource};
pub use service::{Artifact, JobService, ServiceError, SubmittedJob};
pub use store::{ErrorLog, JobStore, StoreError};
pub use worker::TaskRunner;
