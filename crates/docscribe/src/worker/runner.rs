use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::job::Job;
use crate::pipeline::{Pipeline, RunCancellation, RunOutcome};

/// Runs each job's pipeline on its own tokio task.
///
/// Submission never waits for a stage. Jobs run fully in parallel and only
/// contend on the inference slot and the shared resource.
pub struct TaskRunner {
    pipeline: Arc<Pipeline>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    running: Arc<Mutex<HashMap<String, RunCancellation>>>,
}

impl TaskRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        // Shares the tracker of the pipeline's background work so that
        // `wait` also covers pending resource releases.
        let tracker = pipeline.context().background.clone();
        Self {
            pipeline,
            tracker,
            shutdown: CancellationToken::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Creates a job and starts its pipeline. Returns as soon as the job
    /// record is committed.
    pub fn submit(
        &self,
        owner_ref: &str,
        source_ref: &str,
    ) -> Result<(Job, JoinHandle<RunOutcome>), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ShutDown);
        }
        let job = self.pipeline.context().store.create_job(owner_ref, source_ref)?;
        let handle = self.spawn(&job.id)?;
        Ok((job, handle))
    }

    /// Starts the pipeline for an existing job.
    pub fn spawn(&self, job_id: &str) -> Result<JoinHandle<RunOutcome>, WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ShutDown);
        }

        let cancel = RunCancellation::new(&self.shutdown);
        {
            let mut running = self.running.lock().map_err(|_| WorkerError::ShutDown)?;
            if running.contains_key(job_id) {
                return Err(WorkerError::AlreadyRunning(job_id.to_string()));
            }
            running.insert(job_id.to_string(), cancel.clone());
        }

        let pipeline = Arc::clone(&self.pipeline);
        let running = Arc::clone(&self.running);
        let job_id = job_id.to_string();
        debug!(%job_id, "Dispatching job");

        Ok(self.tracker.spawn(async move {
            let outcome = pipeline.run(&job_id, &cancel).await;
            if let Ok(mut running) = running.lock() {
                running.remove(&job_id);
            }
            outcome
        }))
    }

    /// Cancels one running job. The job ends in `error`.
    pub fn cancel(&self, job_id: &str) -> bool {
        let running = match self.running.lock() {
            Ok(running) => running,
            Err(_) => return false,
        };
        match running.get(job_id) {
            Some(cancel) => {
                info!(job_id, "Cancelling job");
                cancel.cancel_job();
                true
            }
            None => false,
        }
    }

    /// Re-dispatches every job that has not reached a terminal status.
    ///
    /// Jobs already running in this process are left alone. Returns the ids
    /// that were dispatched.
    pub fn recover(&self) -> Result<Vec<String>, WorkerError> {
        let jobs = self.pipeline.context().store.list_non_terminal()?;
        let mut dispatched = Vec::with_capacity(jobs.len());

        for job in jobs {
            match self.spawn(&job.id) {
                Ok(_) => {
                    info!(job_id = %job.id, status = %job.status, "Resuming interrupted job");
                    dispatched.push(job.id);
                }
                Err(WorkerError::AlreadyRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !dispatched.is_empty() {
            info!("Resumed {} interrupted jobs", dispatched.len());
        }
        Ok(dispatched)
    }

    pub fn active_count(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting work, cancels running pipelines and waits up to
    /// `grace` for them to park. Returns `false` when the grace ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down task runner...");
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("All jobs have stopped");
                true
            }
            Err(_) => {
                warn!(
                    still_running = self.active_count(),
                    "Shutdown grace period elapsed"
                );
                false
            }
        }
    }

    /// Waits for every dispatched job and background task to finish without
    /// cancelling them.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::testing::{pipeline, FakeAsr};

    #[tokio::test]
    async fn test_submit_returns_before_pipeline_finishes() {
        let h = pipeline(FakeAsr::new("one two three"), true);
        let runner = TaskRunner::new(Arc::clone(&h.pipeline));

        let (job, handle) = runner.submit("alice", "/audio/talk.mp3").unwrap();
        assert_eq!(job.status, JobStatus::Uploading);

        let outcome = handle.await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(h.store.require(&job.id).unwrap().status, JobStatus::Completed);
        assert_eq!(runner.active_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_rejects_duplicate_and_after_shutdown() {
        let h = pipeline(FakeAsr::stalling(), true);
        let runner = TaskRunner::new(Arc::clone(&h.pipeline));

        let (job, _handle) = runner.submit("alice", "/audio/talk.mp3").unwrap();
        assert!(matches!(
            runner.spawn(&job.id),
            Err(WorkerError::AlreadyRunning(_))
        ));

        assert!(runner.shutdown(Duration::from_secs(5)).await);
        assert!(matches!(
            runner.submit("alice", "/audio/b.mp3"),
            Err(WorkerError::ShutDown)
        ));
        // Shutdown parks the job instead of failing it.
        let job = h.store.require(&job.id).unwrap();
        assert!(!job.status.is_terminal());
    }

    #[tokio::test]
    async fn test_recover_resumes_non_terminal_jobs() {
        let h = pipeline(FakeAsr::new("resumed text"), true);
        let parked = h.store.create_job("alice", "/audio/a.mp3").unwrap();
        h.store.transition(&parked.id, JobStatus::Waiting).unwrap();
        let failed = h.store.create_job("bob", "/audio/b.mp3").unwrap();
        h.store.fail_job(&failed.id, "boom", "").unwrap();

        let runner = TaskRunner::new(Arc::clone(&h.pipeline));
        let dispatched = runner.recover().unwrap();
        assert_eq!(dispatched, vec![parked.id.clone()]);

        runner.wait().await;
        assert_eq!(h.store.require(&parked.id).unwrap().status, JobStatus::Completed);
        assert_eq!(h.store.require(&failed.id).unwrap().status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_cancel_fails_single_job() {
        let h = pipeline(FakeAsr::stalling(), true);
        let runner = TaskRunner::new(Arc::clone(&h.pipeline));
        let (job, handle) = runner.submit("alice", "/audio/talk.mp3").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.cancel(&job.id));
        assert!(matches!(handle.await.unwrap(), RunOutcome::Failed { .. }));
        assert_eq!(h.store.require(&job.id).unwrap().status, JobStatus::Error);
        assert!(!runner.cancel(&job.id));
    }
}
