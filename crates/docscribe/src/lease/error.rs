//! Resource lease error types.

use thiserror::Error;

use crate::error::{Classify, ErrorClass};
use crate::store::StoreError;

/// A failed call to the resource control API.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("control API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("control API refused: {0}")]
    Refused(String),
}

impl Classify for ControlError {
    fn class(&self) -> ErrorClass {
        // The control API gives no reliable signal for "will never work",
        // so every failure is worth another attempt.
        ErrorClass::Transient
    }
}

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("resource {action} gave up after {attempts} attempts: {last}")]
    GaveUp {
        action: &'static str,
        attempts: u32,
        #[source]
        last: ControlError,
    },

    #[error("resource {0} cancelled")]
    Cancelled(&'static str),
}

impl Classify for LeaseError {
    fn class(&self) -> ErrorClass {
        match self {
            LeaseError::Store(e) => e.class(),
            LeaseError::GaveUp { .. } | LeaseError::Cancelled(_) => ErrorClass::Permanent,
        }
    }
}
