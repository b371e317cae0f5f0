use thiserror::Error;

use crate::error::{Classify, ErrorClass};

#[derive(Error, Debug)]
pub enum ProofreadError {
    #[error("proofreading request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("proofreading API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse proofreading response: {0}")]
    Parse(String),

    #[error("proofreading backend returned an empty response")]
    EmptyResponse,

    #[error("chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: Box<ProofreadError>,
    },

    #[error("chunk {index} gave up after {attempts} attempts: {last}")]
    ChunkGaveUp {
        index: usize,
        attempts: u32,
        #[source]
        last: Box<ProofreadError>,
    },

    #[error("proofreading cancelled")]
    Cancelled,
}

impl Classify for ProofreadError {
    fn class(&self) -> ErrorClass {
        match self {
            ProofreadError::Transport(_) => ErrorClass::Transient,
            ProofreadError::Status { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}
