use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::convert::DocumentConverter;
use crate::inference::InferenceClient;
use crate::lease::ResourceLeaseManager;
use crate::proofread::ChunkDispatcher;
use crate::storage::ArtifactStore;
use crate::store::JobStore;

/// Collaborators shared by every pipeline run.
pub struct PipelineContext {
    pub store: JobStore,
    pub artifacts: ArtifactStore,
    pub inference: InferenceClient,
    pub dispatcher: ChunkDispatcher,
    pub converter: Arc<dyn DocumentConverter>,
    /// Detached follow-up work (resource release) is tracked here so a
    /// shutdown can wait for it.
    pub background: TaskTracker,
}

impl PipelineContext {
    pub fn lease(&self) -> &Arc<ResourceLeaseManager> {
        self.inference.lease()
    }
}

/// Cancellation of one run: its own token plus the runner-wide shutdown.
///
/// The job token is a child of the shutdown token, so stage code only ever
/// watches [`RunCancellation::token`].
#[derive(Debug, Clone)]
pub struct RunCancellation {
    job: CancellationToken,
    shutdown: CancellationToken,
}

impl RunCancellation {
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            job: shutdown.child_token(),
            shutdown: shutdown.clone(),
        }
    }

    /// A run that is never cancelled.
    pub fn none() -> Self {
        Self::new(&CancellationToken::new())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.job
    }

    /// Cancels this run only.
    pub fn cancel_job(&self) {
        self.job.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
