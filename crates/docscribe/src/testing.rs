//! Fake backends and a pipeline builder shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::task::TaskTracker;

use crate::broadcast::JobProgressBroadcaster;
use crate::convert::{ConvertError, DocumentConverter};
use crate::db::Database;
use crate::inference::{
    InferenceBackend, InferenceClient, InferenceError, InferenceSettings, ResultPoll,
    SubmitRequest,
};
use crate::job::Stage;
use crate::lease::ResourceLeaseManager;
use crate::pipeline::{Pipeline, PipelineContext};
use crate::proofread::{
    ChunkDispatcher, DispatchMode, DispatchSettings, ProofreadBackend, ProofreadError,
};
use crate::retry::RetryPolicy;
use crate::storage::ArtifactStore;
use crate::store::JobStore;

/// Speech backend returning a fixed transcript, or stalling forever.
pub struct FakeAsr {
    pub transcript: Vec<u8>,
    pub stall: bool,
    /// Stall only while the first submission is the latest one.
    pub stall_first: bool,
    pub submits: AtomicU32,
}

impl FakeAsr {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.as_bytes().to_vec(),
            stall: false,
            stall_first: false,
            submits: AtomicU32::new(0),
        }
    }

    pub fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::new("")
        }
    }

    pub fn stalling_first(transcript: &str) -> Self {
        Self {
            stall_first: true,
            ..Self::new(transcript)
        }
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for FakeAsr {
    async fn submit(&self, _request: &SubmitRequest<'_>) -> Result<String, InferenceError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok("queued".to_string())
    }

    async fn fetch_result(&self, _job_id: &str) -> Result<ResultPoll, InferenceError> {
        if self.stall || (self.stall_first && self.submits() == 1) {
            return Ok(ResultPoll::InProgress("in progress".to_string()));
        }
        Ok(ResultPoll::Ready(self.transcript.clone()))
    }
}

/// Proofreader that upper-cases every chunk.
pub struct Upper;

#[async_trait]
impl ProofreadBackend for Upper {
    async fn proofread_chunk(&self, _prompt: &str, text: &str) -> Result<String, ProofreadError> {
        Ok(text.to_uppercase())
    }
}

/// Converter that copies the markdown to the target path.
pub struct CopyConverter;

#[async_trait]
impl DocumentConverter for CopyConverter {
    async fn convert(&self, markdown: &Path, output: &Path) -> Result<PathBuf, ConvertError> {
        tokio::fs::copy(markdown, output)
            .await
            .map_err(|e| ConvertError::Failed(e.to_string()))?;
        Ok(output.to_path_buf())
    }

    fn output_extension(&self) -> &str {
        "docx"
    }
}

pub struct TestPipeline {
    pub dir: TempDir,
    pub pipeline: Arc<Pipeline>,
    pub store: JobStore,
    pub asr: Arc<FakeAsr>,
    pub progress: JobProgressBroadcaster,
}

/// Builds a pipeline over an in-memory store with both prompts active
/// (the proofread prompt only when `proofread_prompt` is set).
pub fn pipeline(asr: FakeAsr, proofread_prompt: bool) -> TestPipeline {
    let dir = TempDir::new().unwrap();
    let progress = JobProgressBroadcaster::new(64);
    let store = JobStore::new(Database::open_in_memory().unwrap()).with_progress(progress.clone());

    let prompt = store.add_prompt(Stage::Transcribe, "names").unwrap();
    store.activate_prompt(Stage::Transcribe, prompt.id).unwrap();
    if proofread_prompt {
        let prompt = store.add_prompt(Stage::Proofread, "fix typos").unwrap();
        store.activate_prompt(Stage::Proofread, prompt.id).unwrap();
    }

    let asr = Arc::new(asr);
    let lease = Arc::new(ResourceLeaseManager::disabled(store.clone()));
    let inference = InferenceClient::new(
        store.clone(),
        asr.clone(),
        lease,
        InferenceSettings {
            poll_interval: Duration::from_millis(5),
            slot_poll: RetryPolicy::unbounded_jittered(
                Duration::from_millis(5),
                Duration::from_millis(10),
            ),
            ..InferenceSettings::default()
        },
    );
    let dispatcher = ChunkDispatcher::new(
        Arc::new(Upper),
        DispatchSettings {
            chunk_word_limit: 2,
            mode: DispatchMode::Concurrent,
            chunk_retry: RetryPolicy::fixed(Duration::from_millis(1), 1),
            ..DispatchSettings::default()
        },
    );

    let pipeline = Pipeline::new(PipelineContext {
        store: store.clone(),
        artifacts: ArtifactStore::new(dir.path(), "docx"),
        inference,
        dispatcher,
        converter: Arc::new(CopyConverter),
        background: TaskTracker::new(),
    });

    TestPipeline {
        dir,
        pipeline: Arc::new(pipeline),
        store,
        asr,
        progress,
    }
}
