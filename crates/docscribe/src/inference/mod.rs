//! Inference client: exclusive slot, resource warm-up, submit, result polling.
//!
//! Only one transcription may be in flight across every process sharing the
//! job store. The slot is a lease row with a holder and an expiry; the holder
//! renews it on a heartbeat, so a crashed holder frees the slot once its
//! lease runs out. A holder whose renewal finds the row taken stops its
//! request with [`InferenceError::SlotLost`].

pub mod backend;
mod error;
pub mod http;

pub use backend::{InferenceBackend, ResultPoll, SubmitRequest};
pub use error::InferenceError;
pub use http::HttpInferenceBackend;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Classify;
use crate::job::{Job, Stage};
use crate::lease::ResourceLeaseManager;
use crate::retry::{self, RetryBudget, RetryError, RetryPolicy};
use crate::store::{JobStore, Prompt};

/// Lease name of the exclusive inference slot.
pub const INFERENCE_SLOT: &str = "inference_slot";

/// How "still processing" answers count against the poll retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StillProcessingBudget {
    /// Progress resets the budget; only consecutive failures count.
    #[default]
    Reset,
    /// Progress answers consume the same budget as transport failures.
    Shared,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Wait before each result poll.
    pub poll_interval: Duration,
    /// Backoff while another job holds the slot.
    pub slot_poll: RetryPolicy,
    pub slot_lease_ttl: Duration,
    pub submit_retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
    pub not_found_retry_limit: u32,
    pub still_processing: StillProcessingBudget,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            slot_poll: RetryPolicy::unbounded_jittered(
                Duration::from_secs(5),
                Duration::from_secs(15),
            ),
            slot_lease_ttl: Duration::from_secs(120),
            submit_retry: RetryPolicy::default(),
            poll_retry: RetryPolicy {
                max_attempts: Some(10),
                ..RetryPolicy::default()
            },
            not_found_retry_limit: 30,
            still_processing: StillProcessingBudget::Reset,
        }
    }
}

/// Holds the exclusive inference slot until dropped.
pub struct SlotGuard {
    store: JobStore,
    holder: String,
    heartbeat: Option<JoinHandle<()>>,
    stop: CancellationToken,
    lost: CancellationToken,
}

impl SlotGuard {
    fn start(store: JobStore, holder: String, ttl: Duration) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let heartbeat = {
            let store = store.clone();
            let holder = holder.clone();
            let stop = stop.clone();
            let lost = lost.clone();
            let every = (ttl / 3).max(Duration::from_millis(10));
            tokio::spawn(async move {
                loop {
                    if retry::sleep(every, &stop).await.is_err() {
                        break;
                    }
                    match store.renew_lease(INFERENCE_SLOT, &holder, ttl) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(%holder, "Inference slot lease lost");
                            lost.cancel();
                            break;
                        }
                        Err(e) => warn!(%holder, error = %e, "Failed to renew inference slot"),
                    }
                }
            })
        };
        Self {
            store,
            holder,
            heartbeat: Some(heartbeat),
            stop,
            lost,
        }
    }

    /// Resolves once another holder has taken the slot.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        match self.store.release_lease(INFERENCE_SLOT, &self.holder) {
            Ok(_) => debug!(holder = %self.holder, "Inference slot released"),
            Err(e) => warn!(holder = %self.holder, error = %e, "Failed to release inference slot"),
        }
    }
}

/// Submits audio to the inference backend and waits for the transcript.
pub struct InferenceClient {
    store: JobStore,
    backend: Arc<dyn InferenceBackend>,
    lease: Arc<ResourceLeaseManager>,
    settings: InferenceSettings,
    instance_id: String,
}

impl InferenceClient {
    pub fn new(
        store: JobStore,
        backend: Arc<dyn InferenceBackend>,
        lease: Arc<ResourceLeaseManager>,
        settings: InferenceSettings,
    ) -> Self {
        Self {
            store,
            backend,
            lease,
            settings,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn lease(&self) -> &Arc<ResourceLeaseManager> {
        &self.lease
    }

    /// Captures the prompt, takes the slot and makes sure the resource runs.
    ///
    /// The returned session holds the slot; submitting and polling happen in
    /// [`InferenceSession::run`].
    pub async fn prepare(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<InferenceSession<'_>, InferenceError> {
        let prompt = self.store.active_prompt(Stage::Transcribe)?;
        self.store
            .set_prompt_version(&job.id, Stage::Transcribe, prompt.version)?;
        debug!(job_id = %job.id, version = prompt.version, "Captured transcription prompt");

        let slot = self.acquire_slot(&job.id, cancel).await?;
        let outcome = self.lease.ensure_running(cancel).await?;
        debug!(job_id = %job.id, ?outcome, "Resource ready");

        Ok(InferenceSession {
            client: self,
            job_id: job.id.clone(),
            audio_path: PathBuf::from(&job.source_ref),
            prompt,
            slot,
        })
    }

    /// Runs the whole transcription for `job`.
    pub async fn transcribe(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, InferenceError> {
        self.prepare(job, cancel).await?.run(cancel).await
    }

    async fn acquire_slot(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SlotGuard, InferenceError> {
        let holder = format!("{}:{}", self.instance_id, job_id);
        let ttl = self.settings.slot_lease_ttl;
        let mut budget = RetryBudget::new(&self.settings.slot_poll);

        loop {
            if self.store.try_acquire_lease(INFERENCE_SLOT, &holder, ttl)? {
                info!(job_id, waited = budget.failures(), "Acquired inference slot");
                return Ok(SlotGuard::start(self.store.clone(), holder, ttl));
            }
            match budget.next_delay() {
                Some(delay) => {
                    if budget.failures() == 1 {
                        info!(job_id, "Inference slot busy, waiting");
                    }
                    retry::sleep(delay, cancel)
                        .await
                        .map_err(|_| InferenceError::Cancelled)?;
                }
                None => {
                    return Err(InferenceError::SlotUnavailable {
                        attempts: budget.failures(),
                    })
                }
            }
        }
    }

    async fn submit(
        &self,
        request: &SubmitRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, InferenceError> {
        let backend = &self.backend;
        retry::retry(&self.settings.submit_retry, cancel, "inference submit", |_| {
            backend.submit(request)
        })
        .await
        .map_err(|e| match e {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => InferenceError::SubmitGaveUp {
                attempts,
                last: Box::new(last),
            },
            RetryError::Cancelled => InferenceError::Cancelled,
        })
    }

    async fn poll_result(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, InferenceError> {
        let mut budget = RetryBudget::new(&self.settings.poll_retry);
        let mut not_found = 0u32;

        loop {
            retry::sleep(self.settings.poll_interval, cancel)
                .await
                .map_err(|_| InferenceError::Cancelled)?;

            match self.backend.fetch_result(job_id).await {
                Ok(ResultPoll::Ready(bytes)) => {
                    info!(job_id, bytes = bytes.len(), "Transcript received");
                    return Ok(bytes);
                }
                Ok(ResultPoll::InProgress(message)) => {
                    debug!(job_id, %message, "Still processing");
                    match self.settings.still_processing {
                        StillProcessingBudget::Reset => budget.reset(),
                        StillProcessingBudget::Shared => {
                            if budget.next_delay().is_none() {
                                return Err(InferenceError::PollGaveUp {
                                    attempts: budget.failures(),
                                    last: Box::new(InferenceError::StillProcessing(message)),
                                });
                            }
                        }
                    }
                }
                Ok(ResultPoll::NotFoundYet(detail)) => {
                    not_found += 1;
                    if not_found > self.settings.not_found_retry_limit {
                        return Err(InferenceError::ResultNotFound {
                            attempts: not_found,
                            detail,
                        });
                    }
                    debug!(job_id, %detail, not_found, "Result not found yet");
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => match budget.next_delay() {
                    Some(delay) => {
                        warn!(job_id, error = %e, ?delay, "Result poll failed, retrying");
                        retry::sleep(delay, cancel)
                            .await
                            .map_err(|_| InferenceError::Cancelled)?;
                    }
                    None => {
                        return Err(InferenceError::PollGaveUp {
                            attempts: budget.failures(),
                            last: Box::new(e),
                        })
                    }
                },
            }
        }
    }
}

/// A prepared transcription holding the inference slot.
pub struct InferenceSession<'a> {
    client: &'a InferenceClient,
    job_id: String,
    audio_path: PathBuf,
    prompt: Prompt,
    slot: SlotGuard,
}

impl InferenceSession<'_> {
    /// Submits the audio and polls until the transcript is ready. The slot is
    /// released when this returns.
    ///
    /// Stops with [`InferenceError::SlotLost`] as soon as the heartbeat finds
    /// the slot held by someone else.
    pub async fn run(self, cancel: &CancellationToken) -> Result<Vec<u8>, InferenceError> {
        let request = SubmitRequest {
            job_id: &self.job_id,
            audio_path: &self.audio_path,
            prompt: &self.prompt.body,
        };
        let work = async {
            self.client.submit(&request, cancel).await?;
            self.client.poll_result(&self.job_id, cancel).await
        };
        tokio::select! {
            biased;
            _ = self.slot.lost() => Err(InferenceError::SlotLost),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend that plays back scripted answers.
    #[derive(Default)]
    struct ScriptedBackend {
        submits: Mutex<VecDeque<Result<String, InferenceError>>>,
        polls: Mutex<VecDeque<Result<ResultPoll, InferenceError>>>,
        submit_calls: AtomicU32,
        poll_calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn with_polls(polls: Vec<Result<ResultPoll, InferenceError>>) -> Self {
            let backend = Self::default();
            backend.polls.lock().unwrap().extend(polls);
            backend
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn submit(&self, _request: &SubmitRequest<'_>) -> Result<String, InferenceError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.submits.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("accepted".to_string()))
        }

        async fn fetch_result(&self, _job_id: &str) -> Result<ResultPoll, InferenceError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.polls.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ResultPoll::Ready(b"transcript".to_vec())))
        }
    }

    fn settings() -> InferenceSettings {
        InferenceSettings {
            poll_interval: Duration::from_secs(10),
            slot_poll: RetryPolicy {
                max_attempts: None,
                deadline_secs: None,
                backoff: retry::Backoff::Fixed { delay_ms: 1_000 },
            },
            slot_lease_ttl: Duration::from_secs(60),
            submit_retry: RetryPolicy::fixed(Duration::from_secs(1), 3),
            poll_retry: RetryPolicy::fixed(Duration::from_secs(1), 3),
            not_found_retry_limit: 2,
            still_processing: StillProcessingBudget::Reset,
        }
    }

    fn setup(backend: Arc<ScriptedBackend>, settings: InferenceSettings) -> (InferenceClient, JobStore, Job) {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let prompt = store.add_prompt(Stage::Transcribe, "glossary").unwrap();
        store.activate_prompt(Stage::Transcribe, prompt.id).unwrap();
        let job = store.create_job("alice", "/audio/a.mp3").unwrap();
        let lease = Arc::new(ResourceLeaseManager::disabled(store.clone()));
        (
            InferenceClient::new(store.clone(), backend, lease, settings),
            store,
            job,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcribe_records_prompt_and_releases_slot() {
        let backend = Arc::new(ScriptedBackend::with_polls(vec![
            Ok(ResultPoll::InProgress("in progress".to_string())),
            Ok(ResultPoll::Ready(b"hello".to_vec())),
        ]));
        let (client, store, job) = setup(backend.clone(), settings());

        let bytes = client.transcribe(&job, &CancellationToken::new()).await.unwrap();

        assert_eq!(bytes, b"hello");
        assert_eq!(backend.poll_calls.load(Ordering::SeqCst), 2);
        let job = store.require(&job.id).unwrap();
        assert_eq!(job.prompt_versions.transcribe, Some(1));
        assert_eq!(store.lease_holder(INFERENCE_SLOT).unwrap(), None);
    }

    #[tokio::test]
    async fn test_permanent_submit_error_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend
            .submits
            .lock()
            .unwrap()
            .push_back(Err(InferenceError::Rejected("bad audio".to_string())));
        let (client, store, job) = setup(backend.clone(), settings());

        let err = client.transcribe(&job, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, InferenceError::Rejected(_)));
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.poll_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.lease_holder(INFERENCE_SLOT).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submit_errors_are_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.submits.lock().unwrap().extend([
            Err(InferenceError::Status {
                status: 503,
                body: String::new(),
            }),
            Err(InferenceError::Status {
                status: 502,
                body: String::new(),
            }),
        ]);
        let (client, _store, job) = setup(backend.clone(), settings());

        client.transcribe(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bare_bad_request_is_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.submits.lock().unwrap().push_back(Err(InferenceError::Status {
            status: 400,
            body: "<html><body>400 Bad Request</body></html>".to_string(),
        }));
        let (client, _store, job) = setup(backend.clone(), settings());

        let bytes = client.transcribe(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(bytes, b"transcript");
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_taken_over_slot_stops_the_run() {
        let backend = Arc::new(ScriptedBackend::with_polls(
            (0..100)
                .map(|_| Ok(ResultPoll::InProgress("in progress".to_string())))
                .collect(),
        ));
        let (client, store, job) = setup(backend.clone(), settings());
        let session = client.prepare(&job, &CancellationToken::new()).await.unwrap();
        let holder = store.lease_holder(INFERENCE_SLOT).unwrap().unwrap();

        // The row is handed to someone else between two heartbeats.
        store.release_lease(INFERENCE_SLOT, &holder).unwrap();
        assert!(store
            .try_acquire_lease(INFERENCE_SLOT, "other-process", Duration::from_secs(60))
            .unwrap());

        let started = tokio::time::Instant::now();
        let err = session.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, InferenceError::SlotLost));
        assert!(err.is_transient());
        // Caught by the first renewal, a third of the lease TTL in.
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert!(backend.poll_calls.load(Ordering::SeqCst) < 100);
        assert_eq!(
            store.lease_holder(INFERENCE_SLOT).unwrap().as_deref(),
            Some("other-process")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_bounded() {
        let backend = Arc::new(ScriptedBackend::with_polls(
            (0..5)
                .map(|_| Ok(ResultPoll::NotFoundYet("not found yet".to_string())))
                .collect(),
        ));
        let (client, _store, job) = setup(backend.clone(), settings());

        let err = client.transcribe(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InferenceError::ResultNotFound { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_processing_budget_modes() {
        let polls = || {
            (0..5)
                .map(|_| Ok(ResultPoll::InProgress("working".to_string())))
                .collect::<Vec<_>>()
        };

        let backend = Arc::new(ScriptedBackend::with_polls(polls()));
        let (client, _store, job) = setup(backend.clone(), settings());
        client.transcribe(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(backend.poll_calls.load(Ordering::SeqCst), 6);

        let mut shared = settings();
        shared.still_processing = StillProcessingBudget::Shared;
        let backend = Arc::new(ScriptedBackend::with_polls(polls()));
        let (client, _store, job) = setup(backend.clone(), shared);
        let err = client.transcribe(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InferenceError::PollGaveUp { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_is_exclusive() {
        let backend = Arc::new(ScriptedBackend::default());
        let (client, store, job) = setup(backend.clone(), settings());

        // Another process holds the slot for 5 seconds.
        assert!(store
            .try_acquire_lease(INFERENCE_SLOT, "other-process", Duration::from_secs(60))
            .unwrap());
        let releaser = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                store.release_lease(INFERENCE_SLOT, "other-process").unwrap();
            })
        };

        let started = tokio::time::Instant::now();
        let session = client.prepare(&job, &CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        let holder = store.lease_holder(INFERENCE_SLOT).unwrap();
        assert!(holder.unwrap().ends_with(&job.id));

        drop(session);
        releaser.await.unwrap();
        assert_eq!(store.lease_holder(INFERENCE_SLOT).unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_prompt_is_permanent() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let job = store.create_job("alice", "/audio/a.mp3").unwrap();
        let lease = Arc::new(ResourceLeaseManager::disabled(store.clone()));
        let client = InferenceClient::new(
            store,
            Arc::new(ScriptedBackend::default()),
            lease,
            settings(),
        );

        let err = client.transcribe(&job, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "No active transcribe prompt set");
        assert!(!err.is_transient());
    }
}
