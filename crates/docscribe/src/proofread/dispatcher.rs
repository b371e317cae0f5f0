//! Chunked proofreading with sequential or bounded-concurrent dispatch.
//!
//! Chunks are reassembled in document order no matter which call finishes
//! first. The first failing chunk aborts the whole document; calls still in
//! flight are dropped.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::ProofreadBackend;
use super::chunker::{split_into_chunks, ChunkBoundary};
use super::error::ProofreadError;
use crate::retry::{self, RetryError, RetryPolicy};

pub const DEFAULT_CHUNK_WORD_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One call at a time.
    #[default]
    Sequential,
    /// Up to `max_concurrency` calls in flight.
    Concurrent,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub chunk_word_limit: usize,
    pub boundary: ChunkBoundary,
    pub mode: DispatchMode,
    /// Calls in flight in concurrent mode. Zero means every chunk at once.
    pub max_concurrency: usize,
    /// Retry of transient failures for a single chunk call.
    pub chunk_retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            chunk_word_limit: DEFAULT_CHUNK_WORD_LIMIT,
            boundary: ChunkBoundary::Words,
            mode: DispatchMode::Sequential,
            max_concurrency: 0,
            chunk_retry: RetryPolicy::default(),
        }
    }
}

/// Result of proofreading one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofreadOutput {
    pub text: String,
    pub chunks: usize,
}

pub struct ChunkDispatcher {
    backend: Arc<dyn ProofreadBackend>,
    settings: DispatchSettings,
}

impl ChunkDispatcher {
    pub fn new(backend: Arc<dyn ProofreadBackend>, settings: DispatchSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Proofreads `document` chunk by chunk under `system_prompt` and joins
    /// the results with a single space.
    pub async fn proofread(
        &self,
        document: &str,
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ProofreadOutput, ProofreadError> {
        let chunks = split_into_chunks(
            document,
            self.settings.chunk_word_limit,
            self.settings.boundary,
        );
        let count = chunks.len();
        info!(chunks = count, mode = ?self.settings.mode, "Proofreading document");

        let processed = match self.settings.mode {
            DispatchMode::Sequential => self.run_sequential(&chunks, system_prompt, cancel).await?,
            DispatchMode::Concurrent => self.run_concurrent(&chunks, system_prompt, cancel).await?,
        };

        Ok(ProofreadOutput {
            text: processed.join(" "),
            chunks: count,
        })
    }

    async fn run_sequential(
        &self,
        chunks: &[String],
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProofreadError> {
        let mut processed = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            processed.push(self.process_chunk(index, chunk, system_prompt, cancel).await?);
        }
        Ok(processed)
    }

    async fn run_concurrent(
        &self,
        chunks: &[String],
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProofreadError> {
        let limit = match self.settings.max_concurrency {
            0 => chunks.len().max(1),
            n => n,
        };

        let mut calls = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let chunk = chunk.as_str();
            calls.push(
                async move {
                    self.process_chunk(index, chunk, system_prompt, cancel)
                        .await
                        .map(|text| (index, text))
                }
                .boxed(),
            );
        }
        let mut results = stream::iter(calls).buffer_unordered(limit);

        let mut slots: Vec<Option<String>> = vec![None; chunks.len()];
        while let Some(result) = results.next().await {
            let (index, text) = result?;
            slots[index] = Some(text);
        }

        // Every index was filled once the stream drained without error.
        Ok(slots.into_iter().flatten().collect())
    }

    async fn process_chunk(
        &self,
        index: usize,
        chunk: &str,
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProofreadError> {
        let backend = &self.backend;
        let started = tokio::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProofreadError::Cancelled),
            result = retry::retry(&self.settings.chunk_retry, cancel, "proofread chunk", |_| {
                backend.proofread_chunk(system_prompt, chunk)
            }) => result,
        };

        match result {
            Ok(text) => {
                debug!(index, elapsed_ms = started.elapsed().as_millis() as u64, "Chunk done");
                Ok(text)
            }
            Err(RetryError::Permanent(e)) => Err(ProofreadError::Chunk {
                index,
                source: Box::new(e),
            }),
            Err(RetryError::Exhausted { attempts, last }) => Err(ProofreadError::ChunkGaveUp {
                index,
                attempts,
                last: Box::new(last),
            }),
            Err(RetryError::Cancelled) => Err(ProofreadError::Cancelled),
        }
    }
}
