use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inference::{InferenceSettings, StillProcessingBudget};
use crate::lease::LeaseSettings;
use crate::proofread::{ChunkBoundary, DispatchMode, DispatchSettings, LlmSettings, ProofreadProvider};
use crate::retry::RetryPolicy;
use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    pub proofreading: ProofreadingConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub artifact_directory: String,
    /// Defaults to `~/.docscribe/data/docscribe.db`.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl StorageConfig {
    pub fn artifact_directory(&self) -> PathBuf {
        PathBuf::from(crate::secrets::expand_home(&self.artifact_directory))
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_deref()
            .map(|p| PathBuf::from(crate::secrets::expand_home(p)))
    }
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_slot_poll() -> RetryPolicy {
    InferenceSettings::default().slot_poll
}

fn default_poll_retry() -> RetryPolicy {
    InferenceSettings::default().poll_retry
}

fn default_not_found_retry_limit() -> u32 {
    30
}

fn default_slot_lease_ttl_secs() -> u64 {
    120
}

fn default_inference_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub submit_url: String,
    pub result_url: String,
    #[serde(default)]
    pub api_key: SecretSource,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_slot_poll")]
    pub slot_poll: RetryPolicy,
    #[serde(default)]
    pub submit_retry: RetryPolicy,
    #[serde(default = "default_poll_retry")]
    pub poll_retry: RetryPolicy,
    #[serde(default = "default_not_found_retry_limit")]
    pub not_found_retry_limit: u32,
    #[serde(default)]
    pub still_processing_budget: StillProcessingBudget,
    #[serde(default = "default_slot_lease_ttl_secs")]
    pub slot_lease_ttl_secs: u64,
    #[serde(default = "default_inference_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl InferenceConfig {
    pub fn settings(&self) -> InferenceSettings {
        InferenceSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            slot_poll: self.slot_poll.clone(),
            slot_lease_ttl: Duration::from_secs(self.slot_lease_ttl_secs),
            submit_retry: self.submit_retry.clone(),
            poll_retry: self.poll_retry.clone(),
            not_found_retry_limit: self.not_found_retry_limit,
            still_processing: self.still_processing_budget,
        }
    }
}

fn default_warm_up_secs() -> u64 {
    60
}

fn default_control_retry() -> RetryPolicy {
    LeaseSettings::default().start_retry
}

fn default_control_timeout_secs() -> u64 {
    30
}

/// Start/stop control of the remote GPU worker. Disabled means the
/// inference backend is always on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub stop_url: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub credentials: SecretSource,
    #[serde(default = "default_warm_up_secs")]
    pub warm_up_secs: u64,
    /// Without `max_attempts` or `deadline_secs` the start call is retried
    /// until it succeeds or the job is cancelled.
    #[serde(default = "default_control_retry")]
    pub start_retry: RetryPolicy,
    #[serde(default = "default_control_retry")]
    pub stop_retry: RetryPolicy,
    #[serde(default = "default_control_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_url: None,
            stop_url: None,
            resource_id: None,
            credentials: SecretSource::default(),
            warm_up_secs: default_warm_up_secs(),
            start_retry: default_control_retry(),
            stop_retry: default_control_retry(),
            request_timeout_secs: default_control_timeout_secs(),
        }
    }
}

impl LeaseConfig {
    pub fn settings(&self) -> LeaseSettings {
        LeaseSettings {
            warm_up: Duration::from_secs(self.warm_up_secs),
            start_retry: self.start_retry.clone(),
            stop_retry: self.stop_retry.clone(),
        }
    }
}

fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_chunk_word_limit() -> usize {
    crate::proofread::dispatcher::DEFAULT_CHUNK_WORD_LIMIT
}

fn default_llm_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofreadingConfig {
    #[serde(default)]
    pub provider: ProofreadProvider,
    /// Required for `openai`; defaults to the public API for `anthropic`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: SecretSource,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_chunk_word_limit")]
    pub chunk_word_limit: usize,
    #[serde(default)]
    pub split_on_sentence: bool,
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Zero means every chunk at once.
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub chunk_retry: RetryPolicy,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProofreadingConfig {
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            chunk_word_limit: self.chunk_word_limit,
            boundary: if self.split_on_sentence {
                ChunkBoundary::Sentence
            } else {
                ChunkBoundary::Words
            },
            mode: self.dispatch,
            max_concurrency: self.max_concurrency,
            chunk_retry: self.chunk_retry.clone(),
        }
    }

    /// The configured key source, or the provider's conventional
    /// environment variable.
    pub fn api_key_source(&self) -> SecretSource {
        if self.api_key.is_configured() {
            return self.api_key.clone();
        }
        match self.provider {
            ProofreadProvider::Anthropic => SecretSource::env("ANTHROPIC_API_KEY"),
            ProofreadProvider::Openai => SecretSource::env("OPENAI_API_KEY"),
        }
    }
}

fn default_pandoc_path() -> String {
    crate::convert::DEFAULT_PANDOC.to_string()
}

fn default_output_format() -> String {
    crate::convert::DEFAULT_OUTPUT_FORMAT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_pandoc_path")]
    pub pandoc_path: String,
    #[serde(default)]
    pub reference_template: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pandoc_path: default_pandoc_path(),
            reference_template: None,
            output_format: default_output_format(),
        }
    }
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Re-dispatch non-terminal jobs at start-up.
    #[serde(default = "default_true")]
    pub resume_interrupted: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
            resume_interrupted: true,
        }
    }
}

impl WorkerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
