//! Shared harness for docscribe integration tests.
//!
//! Builds a full pipeline over an in-memory database with scripted
//! backends, so tests drive the public API end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::task::TaskTracker;

use docscribe::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use docscribe::convert::{ConvertError, DocumentConverter};
use docscribe::db::Database;
use docscribe::inference::{
    InferenceBackend, InferenceClient, InferenceError, InferenceSettings, ResultPoll,
    SubmitRequest,
};
use docscribe::lease::{
    ControlError, ControlOutcome, LeaseSettings, ResourceController, ResourceLeaseManager,
};
use docscribe::pipeline::{Pipeline, PipelineContext};
use docscribe::proofread::{
    ChunkDispatcher, DispatchMode, DispatchSettings, ProofreadBackend, ProofreadError,
};
use docscribe::retry::RetryPolicy;
use docscribe::storage::ArtifactStore;
use docscribe::store::JobStore;
use docscribe::{JobService, Stage, TaskRunner};

/// Speech backend that answers "in progress" a few times per job before
/// returning its transcript. Tracks how many jobs are in flight at once.
pub struct ScriptedAsr {
    transcript: String,
    reject: Option<String>,
    polls_before_ready: u32,
    submits: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    polls: Mutex<std::collections::HashMap<String, u32>>,
}

impl ScriptedAsr {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            reject: None,
            polls_before_ready: 0,
            submits: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            polls: Mutex::new(Default::default()),
        }
    }

    /// Rejects every submission with a 400-style error.
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject: Some(message.to_string()),
            ..Self::new("")
        }
    }

    pub fn slow(mut self, polls_before_ready: u32) -> Self {
        self.polls_before_ready = polls_before_ready;
        self
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedAsr {
    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<String, InferenceError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.reject {
            return Err(InferenceError::Rejected(message.clone()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .insert(request.job_id.to_string(), 0);
        Ok("queued".to_string())
    }

    async fn fetch_result(&self, job_id: &str) -> Result<ResultPoll, InferenceError> {
        let seen = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(job_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if seen <= self.polls_before_ready {
            return Ok(ResultPoll::InProgress("processing".to_string()));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ResultPoll::Ready(self.transcript.clone().into_bytes()))
    }
}

/// Proofreader that upper-cases chunks and counts calls.
#[derive(Default)]
pub struct UppercaseProofreader {
    pub calls: AtomicU32,
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ProofreadBackend for UppercaseProofreader {
    async fn proofread_chunk(&self, system_prompt: &str, text: &str) -> Result<String, ProofreadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(system_prompt.to_string());
        Ok(text.to_uppercase())
    }
}

/// Converter that copies the markdown into the target path.
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

/// Control API that fails a scripted number of starts before succeeding.
pub struct FlakyController {
    start_failures: Mutex<VecDeque<String>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl FlakyController {
    pub fn failing_starts(failures: usize) -> Self {
        Self {
            start_failures: Mutex::new(
                (0..failures)
                    .map(|i| format!("capacity unavailable ({})", i + 1))
                    .collect(),
            ),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ResourceController for FlakyController {
    async fn start(&self) -> Result<ControlOutcome, ControlError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match self.start_failures.lock().unwrap().pop_front() {
            Some(reason) => Err(ControlError::Refused(reason)),
            None => Ok(ControlOutcome::Applied),
        }
    }

    async fn stop(&self) -> Result<ControlOutcome, ControlError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(ControlOutcome::Applied)
    }
}

pub struct HarnessOptions {
    pub chunk_word_limit: usize,
    pub controller: Option<Arc<dyn ResourceController>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            chunk_word_limit: 500,
            controller: None,
        }
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub store: JobStore,
    pub progress: JobProgressBroadcaster,
    pub runner: Arc<TaskRunner>,
    pub service: JobService,
}

impl TestHarness {
    pub fn new(
        asr: Arc<dyn InferenceBackend>,
        proofreader: Arc<dyn ProofreadBackend>,
        options: HarnessOptions,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let progress = JobProgressBroadcaster::new(1024);
        let store = JobStore::new(Database::open_in_memory().expect("Failed to open database"))
            .with_progress(progress.clone());

        for (stage, body) in [
            (Stage::Transcribe, "Speaker names: Ada, Grace."),
            (Stage::Proofread, "Fix spelling. Keep wording."),
        ] {
            let prompt = store.add_prompt(stage, body).expect("Failed to add prompt");
            store
                .activate_prompt(stage, prompt.id)
                .expect("Failed to activate prompt");
        }

        let lease = match options.controller {
            Some(controller) => ResourceLeaseManager::new(
                store.clone(),
                controller,
                LeaseSettings {
                    warm_up: Duration::from_millis(1),
                    start_retry: RetryPolicy::fixed(Duration::from_millis(1), 5),
                    stop_retry: RetryPolicy::fixed(Duration::from_millis(1), 5),
                },
            ),
            None => ResourceLeaseManager::disabled(store.clone()),
        };

        let inference = InferenceClient::new(
            store.clone(),
            asr,
            Arc::new(lease),
            InferenceSettings {
                poll_interval: Duration::from_millis(2),
                slot_poll: RetryPolicy::unbounded_jittered(
                    Duration::from_millis(2),
                    Duration::from_millis(5),
                ),
                submit_retry: RetryPolicy::fixed(Duration::from_millis(1), 3),
                ..InferenceSettings::default()
            },
        );

        let dispatcher = ChunkDispatcher::new(
            proofreader,
            DispatchSettings {
                chunk_word_limit: options.chunk_word_limit,
                mode: DispatchMode::Concurrent,
                max_concurrency: 4,
                chunk_retry: RetryPolicy::fixed(Duration::from_millis(1), 2),
                ..DispatchSettings::default()
            },
        );

        let pipeline = Arc::new(Pipeline::new(PipelineContext {
            store: store.clone(),
            artifacts: ArtifactStore::new(temp_dir.path().join("artifacts"), "docx"),
            inference,
            dispatcher,
            converter: Arc::new(CopyConverter),
            background: TaskTracker::new(),
        }));
        let runner = Arc::new(TaskRunner::new(pipeline));
        let service = JobService::new(Arc::clone(&runner));

        Self {
            temp_dir,
            store,
            progress,
            runner,
            service,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a fake audio file and returns its path as a source reference.
    pub fn write_audio(&self, name: &str) -> String {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, b"ID3 fake audio").expect("Failed to write audio");
        path.display().to_string()
    }
}

/// Drains every event currently buffered for `job_id`.
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<JobProgressEvent>,
    job_id: &str,
) -> Vec<JobProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.job_id == job_id {
            events.push(event);
        }
    }
    events
}

pub fn words(count: usize) -> String {
    (0..count)
        .map(|i| format!("word{}", i))
        .collect::<Vec<_>>()
        .join(" ")
}
