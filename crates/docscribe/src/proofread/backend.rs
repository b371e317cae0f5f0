use async_trait::async_trait;

use super::error::ProofreadError;

/// An LLM that proofreads one chunk of text under a system prompt.
///
/// Implementors must be `Send + Sync`; the dispatcher shares one backend
/// across concurrent chunk calls.
#[async_trait]
pub trait ProofreadBackend: Send + Sync {
    async fn proofread_chunk(&self, system_prompt: &str, text: &str)
        -> Result<String, ProofreadError>;
}
