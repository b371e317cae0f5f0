//! Remote compute resource lifecycle (the GPU worker).
//!
//! The shared `running` flag lives in the job store so every process sees the
//! same value. Start and stop are serialised in-process by a transition lock
//! and the flag is only read under it, so callers that queued behind a
//! successful start return without calling start again. A release clears the
//! flag before it calls stop and puts it back if the stop never lands, so a
//! reader never sees `running` for a resource that is going away.
//! "Already running" / "already stopped" answers from the control API are
//! the safety net across processes.

mod error;
pub mod http;

pub use error::{ControlError, LeaseError};
pub use http::HttpResourceController;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{self, RetryBudget, RetryPolicy};
use crate::store::JobStore;

/// What a start or stop call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The resource changed state.
    Applied,
    /// The resource was already in the requested state.
    AlreadyInState,
}

/// Start/stop control over the remote resource.
#[async_trait]
pub trait ResourceController: Send + Sync {
    async fn start(&self) -> Result<ControlOutcome, ControlError>;
    async fn stop(&self) -> Result<ControlOutcome, ControlError>;
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Time the resource needs after a start before it accepts work.
    pub warm_up: Duration,
    pub start_retry: RetryPolicy,
    pub stop_retry: RetryPolicy,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        let retry = RetryPolicy::unbounded_jittered(Duration::from_secs(5), Duration::from_secs(15));
        Self {
            warm_up: Duration::from_secs(60),
            start_retry: retry.clone(),
            stop_retry: retry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The flag already said running.
    AlreadyRunning,
    /// This call started the resource.
    Started { attempts: u32 },
    /// The control API reported it was already running; the flag was stale.
    Adopted { attempts: u32 },
    /// No resource is managed.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Jobs still need the resource.
    Busy { active: u64 },
    AlreadyStopped,
    Stopped { attempts: u32 },
    Disabled,
}

pub struct ResourceLeaseManager {
    store: JobStore,
    controller: Option<Arc<dyn ResourceController>>,
    settings: LeaseSettings,
    transition_lock: Mutex<()>,
}

impl ResourceLeaseManager {
    pub fn new(
        store: JobStore,
        controller: Arc<dyn ResourceController>,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            store,
            controller: Some(controller),
            settings,
            transition_lock: Mutex::new(()),
        }
    }

    /// A manager for an always-on backend: every call is a no-op.
    pub fn disabled(store: JobStore) -> Self {
        Self {
            store,
            controller: None,
            settings: LeaseSettings::default(),
            transition_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.controller.is_some()
    }

    /// Makes sure the resource is running before inference work is sent.
    pub async fn ensure_running(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EnsureOutcome, LeaseError> {
        let Some(controller) = self.controller.as_ref() else {
            return Ok(EnsureOutcome::Disabled);
        };
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled("start")),
            guard = self.transition_lock.lock() => guard,
        };

        let mut budget = RetryBudget::new(&self.settings.start_retry);
        loop {
            if self.store.resource_running()? {
                return Ok(EnsureOutcome::AlreadyRunning);
            }
            if cancel.is_cancelled() {
                return Err(LeaseError::Cancelled("start"));
            }

            let attempts = budget.failures() + 1;
            match controller.start().await {
                Ok(ControlOutcome::Applied) => {
                    info!(
                        attempts,
                        warm_up_secs = self.settings.warm_up.as_secs(),
                        "Resource started, waiting for warm-up"
                    );
                    retry::sleep(self.settings.warm_up, cancel)
                        .await
                        .map_err(|_| LeaseError::Cancelled("start"))?;
                    if !self.store.compare_and_set_running(false, true)? {
                        debug!("Running flag was set by another process during warm-up");
                    }
                    return Ok(EnsureOutcome::Started { attempts });
                }
                Ok(ControlOutcome::AlreadyInState) => {
                    info!(attempts, "Resource already running, adopting it");
                    self.store.set_running(true)?;
                    return Ok(EnsureOutcome::Adopted { attempts });
                }
                Err(e) => match budget.next_delay() {
                    Some(delay) => {
                        warn!(attempt = attempts, error = %e, ?delay, "Resource start failed, retrying");
                        retry::sleep(delay, cancel)
                            .await
                            .map_err(|_| LeaseError::Cancelled("start"))?;
                    }
                    None => {
                        return Err(LeaseError::GaveUp {
                            action: "start",
                            attempts: budget.failures(),
                            last: e,
                        })
                    }
                },
            }
        }
    }

    /// Stops the resource when no job still needs it.
    pub async fn release_if_idle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let Some(controller) = self.controller.as_ref() else {
            return Ok(ReleaseOutcome::Disabled);
        };
        let active = self.store.count_active_resource_jobs()?;
        if active > 0 {
            return Ok(ReleaseOutcome::Busy { active });
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled("stop")),
            guard = self.transition_lock.lock() => guard,
        };

        let active = self.store.count_active_resource_jobs()?;
        if active > 0 {
            return Ok(ReleaseOutcome::Busy { active });
        }
        if !self.store.compare_and_set_running(true, false)? {
            return Ok(ReleaseOutcome::AlreadyStopped);
        }

        let mut budget = RetryBudget::new(&self.settings.stop_retry);
        loop {
            if cancel.is_cancelled() {
                self.restore_running()?;
                return Err(LeaseError::Cancelled("stop"));
            }

            let attempts = budget.failures() + 1;
            match controller.stop().await {
                Ok(outcome) => {
                    info!(attempts, ?outcome, "Resource released");
                    return Ok(ReleaseOutcome::Stopped { attempts });
                }
                Err(e) => match budget.next_delay() {
                    Some(delay) => {
                        warn!(attempt = attempts, error = %e, ?delay, "Resource stop failed, retrying");
                        if retry::sleep(delay, cancel).await.is_err() {
                            self.restore_running()?;
                            return Err(LeaseError::Cancelled("stop"));
                        }
                        let active = self.store.count_active_resource_jobs()?;
                        if active > 0 {
                            info!(active, "Job arrived while stopping, keeping resource");
                            self.restore_running()?;
                            return Ok(ReleaseOutcome::Busy { active });
                        }
                    }
                    None => {
                        self.restore_running()?;
                        return Err(LeaseError::GaveUp {
                            action: "stop",
                            attempts: budget.failures(),
                            last: e,
                        });
                    }
                },
            }
        }
    }

    /// Puts the flag back after a stop that did not happen.
    fn restore_running(&self) -> Result<(), LeaseError> {
        if !self.store.compare_and_set_running(false, true)? {
            debug!("Running flag was set by another process during stop");
        }
        Ok(())
    }
}
