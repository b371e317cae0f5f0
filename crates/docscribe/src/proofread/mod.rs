//! Proofreading stage: chunking, dispatch and the LLM backends.

pub mod anthropic;
pub mod backend;
pub mod chunker;
pub mod dispatcher;
mod error;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use backend::ProofreadBackend;
pub use chunker::{split_into_chunks, ChunkBoundary};
pub use dispatcher::{ChunkDispatcher, DispatchMode, DispatchSettings, ProofreadOutput};
pub use error::ProofreadError;
pub use openai::OpenAiBackend;

use serde::{Deserialize, Serialize};

/// Which LLM API serves proofreading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofreadProvider {
    #[default]
    Anthropic,
    /// Any OpenAI-compatible chat-completions endpoint.
    Openai,
}

/// Model parameters shared by the LLM backends.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}
