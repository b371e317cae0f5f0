//! Wires a loaded [`Config`] into a running set of components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::broadcast::JobProgressBroadcaster;
use crate::config::{Config, LeaseConfig, ProofreadingConfig};
use crate::convert::{DocumentConverter, PandocConverter};
use crate::db::{default_database_path, Database};
use crate::error::{DocscribeError, Result};
use crate::inference::{HttpInferenceBackend, InferenceClient};
use crate::lease::{HttpResourceController, ResourceLeaseManager};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::proofread::{
    AnthropicBackend, ChunkDispatcher, OpenAiBackend, ProofreadBackend, ProofreadProvider,
};
use crate::sanitize::redact_url;
use crate::service::JobService;
use crate::storage::ArtifactStore;
use crate::store::JobStore;
use crate::worker::TaskRunner;

const PROGRESS_CAPACITY: usize = 256;

/// Everything a process needs to accept and run jobs.
pub struct App {
    pub store: JobStore,
    pub progress: JobProgressBroadcaster,
    pub runner: Arc<TaskRunner>,
    pub service: JobService,
    pub shutdown_grace: Duration,
    pub resume_interrupted: bool,
}

impl App {
    /// Opens the database and builds every backend named in `config`.
    /// Starts no jobs.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db_path = config
            .storage
            .database_path()
            .or_else(default_database_path)
            .ok_or_else(|| DocscribeError::Backend("No home directory for the database".into()))?;
        let db = Database::open(&db_path)?;
        Self::with_database(config, db)
    }

    /// Like [`from_config`](Self::from_config) over an already opened database.
    pub fn with_database(config: &Config, db: Database) -> Result<Self> {
        let progress = JobProgressBroadcaster::new(PROGRESS_CAPACITY);
        let store = JobStore::new(db).with_progress(progress.clone());

        let converter = PandocConverter::new(
            Some(&config.conversion.pandoc_path),
            config.conversion.reference_template.as_deref().map(PathBuf::from),
            Some(&config.conversion.output_format),
        );
        let artifacts =
            ArtifactStore::new(config.storage.artifact_directory(), converter.output_extension());

        let lease = Arc::new(build_lease(&config.lease, store.clone())?);

        let inference_config = &config.inference;
        let api_key = inference_config
            .api_key
            .resolve_optional()?
            .unwrap_or_else(|| SecretString::from(""));
        let asr = HttpInferenceBackend::new(
            &inference_config.submit_url,
            &inference_config.result_url,
            api_key,
            inference_config.language.clone(),
            Duration::from_secs(inference_config.request_timeout_secs),
        )
        .map_err(|e| DocscribeError::Backend(format!("inference client: {}", e)))?;
        info!(
            submit_url = %redact_url(&inference_config.submit_url),
            "Inference backend configured"
        );
        let inference = InferenceClient::new(
            store.clone(),
            Arc::new(asr),
            lease,
            inference_config.settings(),
        );

        let dispatcher = ChunkDispatcher::new(
            build_proofreader(&config.proofreading)?,
            config.proofreading.dispatch_settings(),
        );

        let pipeline = Arc::new(Pipeline::new(PipelineContext {
            store: store.clone(),
            artifacts,
            inference,
            dispatcher,
            converter: Arc::new(converter),
            background: TaskTracker::new(),
        }));
        let runner = Arc::new(TaskRunner::new(pipeline));
        let service = JobService::new(Arc::clone(&runner));

        Ok(Self {
            store,
            progress,
            runner,
            service,
            shutdown_grace: config.worker.shutdown_grace(),
            resume_interrupted: config.worker.resume_interrupted,
        })
    }

    /// Re-dispatches interrupted jobs when the config asks for it.
    pub fn recover(&self) -> Result<Vec<String>> {
        if !self.resume_interrupted {
            return Ok(Vec::new());
        }
        Ok(self.runner.recover()?)
    }

    pub async fn shutdown(&self) -> bool {
        self.runner.shutdown(self.shutdown_grace).await
    }
}

fn build_lease(config: &LeaseConfig, store: JobStore) -> Result<ResourceLeaseManager> {
    if !config.enabled {
        info!("Resource leasing disabled; inference backend treated as always on");
        return Ok(ResourceLeaseManager::disabled(store));
    }

    let missing = |field: &str| DocscribeError::Backend(format!("lease.{} is not set", field));
    let start_url = config.start_url.as_deref().ok_or_else(|| missing("start_url"))?;
    let stop_url = config.stop_url.as_deref().ok_or_else(|| missing("stop_url"))?;
    let resource_id = config.resource_id.as_deref().ok_or_else(|| missing("resource_id"))?;

    let controller = HttpResourceController::new(
        start_url,
        stop_url,
        resource_id,
        config.credentials.resolve()?,
        Duration::from_secs(config.request_timeout_secs),
    )
    .map_err(|e| DocscribeError::Backend(format!("resource controller: {}", e)))?;
    info!(
        start_url = %redact_url(start_url),
        resource_id,
        "Resource leasing enabled"
    );

    Ok(ResourceLeaseManager::new(
        store,
        Arc::new(controller),
        config.settings(),
    ))
}

fn build_proofreader(config: &ProofreadingConfig) -> Result<Arc<dyn ProofreadBackend>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let backend: Arc<dyn ProofreadBackend> = match config.provider {
        ProofreadProvider::Anthropic => {
            let api_key = config.api_key_source().resolve()?;
            Arc::new(
                AnthropicBackend::new(
                    config.base_url.as_deref(),
                    api_key,
                    config.llm_settings(),
                    timeout,
                )
                .map_err(|e| DocscribeError::Backend(format!("anthropic client: {}", e)))?,
            )
        }
        ProofreadProvider::Openai => {
            let base_url = config.base_url.as_deref().ok_or_else(|| {
                DocscribeError::Backend("proofreading.base_url is not set".into())
            })?;
            // Local OpenAI-compatible servers usually take no key.
            let api_key = config.api_key_source().resolve_optional().ok().flatten();
            Arc::new(
                OpenAiBackend::new(base_url, api_key, config.llm_settings(), timeout)
                    .map_err(|e| DocscribeError::Backend(format!("openai client: {}", e)))?,
            )
        }
    };
    info!(provider = ?config.provider, model = %config.model, "Proofreading backend configured");
    Ok(backend)
}
