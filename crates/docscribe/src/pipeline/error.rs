use thiserror::Error;

use crate::convert::ConvertError;
use crate::error::{Classify, ErrorClass, StorageError};
use crate::inference::InferenceError;
use crate::lease::LeaseError;
use crate::proofread::ProofreadError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Proofread(#[from] ProofreadError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Job has no {0} artifact to continue from")]
    MissingArtifact(crate::job::ArtifactKind),

    #[error("Job cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the failure came from a cancellation rather than a backend.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Inference(InferenceError::Cancelled)
                | PipelineError::Inference(InferenceError::Lease(LeaseError::Cancelled(_)))
                | PipelineError::Proofread(ProofreadError::Cancelled)
        )
    }
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Inference(e) => e.class(),
            PipelineError::Proofread(e) => e.class(),
            PipelineError::Convert(e) => e.class(),
            PipelineError::Store(e) => e.class(),
            _ => ErrorClass::Permanent,
        }
    }
}
