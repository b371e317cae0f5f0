use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::render_chain;
use crate::inference::InferenceError;
use crate::job::{ArtifactKind, Job, JobStatus, Stage};

use super::context::{PipelineContext, RunCancellation};
use super::error::PipelineError;

/// Times one transcription may lose the inference slot before the job fails.
const MAX_SLOT_LOSSES: u32 = 3;

/// How a single pipeline run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Job),
    /// The job was marked `error` and one error log was written.
    Failed { job_id: String, message: String },
    /// The runner shut down mid-stage; the job stays at its last status.
    Interrupted { job_id: String, status: Option<JobStatus> },
    /// Nothing to do: the job had already finished.
    AlreadyTerminal(Job),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// Drives one job through transcribe, proofread and convert.
///
/// Every status and artifact write commits on its own. A stage whose
/// artifact already exists is skipped, so an interrupted job can be run
/// again from the status it was parked at.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Runs the pipeline for `job_id` until it completes, fails or is
    /// interrupted. Never returns an error: failures are recorded on the job.
    pub async fn run(&self, job_id: &str, cancel: &RunCancellation) -> RunOutcome {
        let span = info_span!("pipeline", job_id = %job_id);
        self.run_inner(job_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, job_id: &str, cancel: &RunCancellation) -> RunOutcome {
        let job = match self.ctx.store.require(job_id) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Cannot load job");
                return RunOutcome::Failed {
                    job_id: job_id.to_string(),
                    message: e.to_string(),
                };
            }
        };
        if job.status.is_terminal() {
            debug!(status = %job.status, "Job already finished");
            return RunOutcome::AlreadyTerminal(job);
        }

        info!(
            status = %job.status,
            source = %crate::sanitize::redact_path(Path::new(&job.source_ref)),
            "Pipeline started"
        );

        let mut stage = None;
        let result = self.drive(job, cancel, &mut stage).await;
        match result {
            Ok(job) => {
                info!("Pipeline completed");
                RunOutcome::Completed(job)
            }
            Err(e) if e.is_cancelled() && cancel.is_shutdown() => {
                let status = self.ctx.store.get(job_id).ok().flatten().map(|j| j.status);
                info!(?status, "Pipeline interrupted by shutdown; job left in place");
                RunOutcome::Interrupted {
                    job_id: job_id.to_string(),
                    status,
                }
            }
            Err(e) => self.fail(job_id, stage, e, cancel),
        }
    }

    async fn drive(
        &self,
        mut job: Job,
        cancel: &RunCancellation,
        stage: &mut Option<Stage>,
    ) -> Result<Job, PipelineError> {
        if job.status == JobStatus::Uploading {
            job = self.ctx.store.transition(&job.id, JobStatus::Waiting)?;
        }

        if job.status.rank() <= JobStatus::Transcribing.rank() {
            *stage = Some(Stage::Transcribe);
            job = self
                .transcribe(job, cancel)
                .instrument(info_span!("transcribe"))
                .await?;
        }

        if job.status.rank() <= JobStatus::Proofreading.rank() {
            *stage = Some(Stage::Proofread);
            job = self
                .proofread(job, cancel)
                .instrument(info_span!("proofread"))
                .await?;
        }

        if job.status.rank() <= JobStatus::Converting.rank() {
            *stage = Some(Stage::Convert);
            job = self
                .convert(job, cancel)
                .instrument(info_span!("convert"))
                .await?;
        }

        Ok(job)
    }

    async fn transcribe(&self, job: Job, cancel: &RunCancellation) -> Result<Job, PipelineError> {
        let store = &self.ctx.store;
        if cancel.token().is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if job.has_artifact(ArtifactKind::Transcript) {
            debug!("Transcript already stored, skipping inference");
        } else {
            let mut losses = 0;
            let transcript = loop {
                // Waits for the slot and the resource before the status moves.
                let session = self.ctx.inference.prepare(&job, cancel.token()).await?;
                store.transition(&job.id, JobStatus::Transcribing)?;

                match session.run(cancel.token()).await {
                    Err(InferenceError::SlotLost) if losses < MAX_SLOT_LOSSES => {
                        losses += 1;
                        warn!(losses, "Inference slot lost mid-run, queueing for it again");
                    }
                    result => break result?,
                }
            };
            let path = self.ctx.artifacts.write(
                &job.id,
                &job.source_ref,
                ArtifactKind::Transcript,
                &transcript,
            )?;
            store.set_artifact(&job.id, ArtifactKind::Transcript, &path.to_string_lossy())?;
            info!(bytes = transcript.len(), "Transcript stored");
        }

        Ok(store.transition(&job.id, JobStatus::WaitingForProofreading)?)
    }

    async fn proofread(&self, job: Job, cancel: &RunCancellation) -> Result<Job, PipelineError> {
        let store = &self.ctx.store;
        if cancel.token().is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let job = store.transition(&job.id, JobStatus::Proofreading)?;
        // The job no longer needs the inference resource.
        self.spawn_release(cancel);

        if job.has_artifact(ArtifactKind::Proofread) {
            debug!("Proofread text already stored, skipping");
            return Ok(job);
        }

        let prompt = store.active_prompt(Stage::Proofread)?;
        store.set_prompt_version(&job.id, Stage::Proofread, prompt.version)?;

        let transcript_path = job
            .artifact_paths
            .get(ArtifactKind::Transcript)
            .ok_or(PipelineError::MissingArtifact(ArtifactKind::Transcript))?;
        let transcript = self.ctx.artifacts.read(Path::new(transcript_path))?;
        let transcript = String::from_utf8_lossy(&transcript);

        let output = self
            .ctx
            .dispatcher
            .proofread(&transcript, &prompt.body, cancel.token())
            .await?;
        let path = self.ctx.artifacts.write(
            &job.id,
            &job.source_ref,
            ArtifactKind::Proofread,
            output.text.as_bytes(),
        )?;
        store.set_artifact(&job.id, ArtifactKind::Proofread, &path.to_string_lossy())?;
        info!(chunks = output.chunks, version = prompt.version, "Proofread text stored");

        Ok(store.require(&job.id)?)
    }

    async fn convert(&self, job: Job, cancel: &RunCancellation) -> Result<Job, PipelineError> {
        let store = &self.ctx.store;
        if cancel.token().is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let job = store.transition(&job.id, JobStatus::Converting)?;
        if job.has_artifact(ArtifactKind::Document) {
            debug!("Document already stored, skipping conversion");
        } else {
            let markdown = job
                .artifact_paths
                .get(ArtifactKind::Proofread)
                .ok_or(PipelineError::MissingArtifact(ArtifactKind::Proofread))?;
            let target =
                self.ctx
                    .artifacts
                    .prepare(&job.id, &job.source_ref, ArtifactKind::Document)?;

            let produced = tokio::select! {
                biased;
                _ = cancel.token().cancelled() => return Err(PipelineError::Cancelled),
                result = self.ctx.converter.convert(Path::new(markdown), &target) => result?,
            };
            store.set_artifact(&job.id, ArtifactKind::Document, &produced.to_string_lossy())?;
            info!("Document stored");
        }

        Ok(store.transition(&job.id, JobStatus::Completed)?)
    }

    fn fail(
        &self,
        job_id: &str,
        stage: Option<Stage>,
        err: PipelineError,
        cancel: &RunCancellation,
    ) -> RunOutcome {
        let message = err.to_string();
        let trace = stack_trace(stage, &err);

        match self.ctx.store.fail_job(job_id, &message, &trace) {
            Ok(true) => error!(stage = ?stage, error = %message, "Pipeline failed"),
            Ok(false) => warn!(error = %message, "Job already finished; failure not recorded"),
            Err(e) => error!(error = %e, cause = %message, "Failed to record job failure"),
        }
        self.spawn_release(cancel);

        RunOutcome::Failed {
            job_id: job_id.to_string(),
            message,
        }
    }

    /// Lets the resource go in the background if no job needs it anymore.
    fn spawn_release(&self, cancel: &RunCancellation) {
        let lease = Arc::clone(self.ctx.lease());
        if !lease.is_enabled() {
            return;
        }
        let shutdown = cancel.shutdown_token().clone();
        self.ctx.background.spawn(
            async move {
                match lease.release_if_idle(&shutdown).await {
                    Ok(outcome) => debug!(?outcome, "Resource release checked"),
                    Err(e) => warn!(error = %e, "Resource release failed"),
                }
            }
            .in_current_span(),
        );
    }
}

/// Error chain prefixed by the failing stage, plus a backtrace when
/// `RUST_BACKTRACE` enables capturing.
fn stack_trace(stage: Option<Stage>, err: &PipelineError) -> String {
    let mut trace = match stage {
        Some(stage) => format!("{} stage failed: {}", stage, render_chain(err)),
        None => render_chain(err),
    };
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push_str("\n\nbacktrace:\n");
        trace.push_str(&backtrace.to_string());
    }
    trace
}
