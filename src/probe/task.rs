//! A run-at-most-once task slot. One probe may be in flight per slot; what
//! happens to a second start request depends on the slot's restart policy.
//!
//! Cancellation is cooperative: the spawned future receives a token and is
//! expected to observe it at its suspension points. The slot only tracks
//! completion, it never drops a future mid-poll. A successful start hands
//! back a [`RunHandle`] scoped to that run, so a caller can only ever
//! cancel or await the run it started itself.

use std::future::Future;
use std::sync::Mutex;

use log::debug;
use tokio_util::sync::CancellationToken;

use keel_api::error::{AlreadyRunningError, StorageError};

/// What a start request does when a run is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Refuse with `AlreadyRunning`; the active run must not be disturbed.
    Reject,
    /// Cancel the active run and start a fresh one.
    CancelAndRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A previous run was cancelled to make room.
    Restarted,
}

struct Run {
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Handle to one specific run of a [`SingleTask`].
#[derive(Debug)]
pub struct RunHandle {
    outcome: StartOutcome,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl RunHandle {
    pub fn outcome(&self) -> StartOutcome {
        self.outcome
    }

    /// Cancel this run. Later runs in the same slot are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for this run to finish.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }
}

pub struct SingleTask {
    name: &'static str,
    policy: RestartPolicy,
    run: Mutex<Option<Run>>,
}

impl SingleTask {
    pub fn new(name: &'static str, policy: RestartPolicy) -> Self {
        SingleTask {
            name,
            policy,
            run: Mutex::new(None),
        }
    }

    /// Spawn `f` as the slot's run. The closure receives the run's
    /// cancellation token.
    pub fn start<F, Fut>(&self, f: F) -> Result<RunHandle, StorageError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.run.lock().unwrap();
        let mut outcome = StartOutcome::Started;
        if let Some(run) = slot.as_ref() {
            if !run.finished.is_cancelled() {
                match self.policy {
                    RestartPolicy::Reject => {
                        return Err(AlreadyRunningError::Task {
                            name: self.name.to_string(),
                        }
                        .into());
                    }
                    RestartPolicy::CancelAndRestart => {
                        debug!("task '{}': cancelling active run for restart", self.name);
                        run.cancel.cancel();
                        outcome = StartOutcome::Restarted;
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let fut = f(cancel.clone());
        let run_finished = finished.clone();
        tokio::spawn(async move {
            fut.await;
            run_finished.cancel();
        });

        *slot = Some(Run {
            cancel: cancel.clone(),
            finished: finished.clone(),
        });
        Ok(RunHandle {
            outcome,
            cancel,
            finished,
        })
    }

    /// Cancel the active run, if any. The run observes the token at its
    /// next suspension point.
    pub fn cancel(&self) {
        if let Some(run) = self.run.lock().unwrap().as_ref() {
            run.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| !r.finished.is_cancelled())
            .unwrap_or(false)
    }

    /// A run was started at least once over the slot's lifetime.
    pub fn has_run(&self) -> bool {
        self.run.lock().unwrap().is_some()
    }

    /// Wait for the run that is current at call time. Returns immediately
    /// when the slot is idle.
    pub async fn wait(&self) {
        let finished = self
            .run
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }
}
