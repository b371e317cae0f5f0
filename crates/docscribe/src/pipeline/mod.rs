pub mod context;
pub mod error;
pub mod runner;

pub use context::{PipelineContext, RunCancellation};
pub use error::PipelineError;
pub use runner::{Pipeline, RunOutcome};
