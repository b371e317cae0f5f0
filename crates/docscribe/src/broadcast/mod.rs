//! Broadcasting modules for real-time event streaming.
//!
//! Observers in the same process (the CLI `run` command, tests) subscribe
//! here instead of polling the job store.

pub mod job_progress;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent};
