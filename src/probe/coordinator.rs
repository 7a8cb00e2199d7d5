//! Runs hardware enumeration exactly once at a time: safe pass first, then
//! the privileged fallback, stopping at the first success. Each attempt is
//! bounded by a timeout; failures are recorded per probe class and never
//! fail the run as a whole. Once storage decisions are final, successful
//! results are discarded instead of applied.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use log::{debug, error, warn};
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;

use blkutils::arch::SystemArchitecture;
use keel_api::{
    error::{ErrorKind, ProbeFailureError},
    status::{ProbeErrorRef, ProbeStatus},
};

use crate::{
    diagnostics::DiagnosticsSink,
    model::StorageModel,
    probe::{
        task::{RestartPolicy, SingleTask, StartOutcome},
        ProbeClass, Prober,
    },
};

/// Bound on a single probe attempt. Block probing is much slower on RISC-V.
pub fn default_probe_timeout() -> Duration {
    match SystemArchitecture::current() {
        SystemArchitecture::Riscv64 => Duration::from_secs(60),
        _ => Duration::from_secs(15),
    }
}

/// Latest recorded failure per probe class. A fixed two-slot record: the
/// key domain is exactly the two classes.
#[derive(Default)]
pub struct ErrorAggregator {
    slots: Mutex<ErrorSlots>,
}

#[derive(Default, Clone)]
struct ErrorSlots {
    safe: Option<ProbeFailureError>,
    privileged: Option<ProbeFailureError>,
}

impl ErrorAggregator {
    pub fn clear(&self) {
        *self.slots.lock().unwrap() = ErrorSlots::default();
    }

    /// Record a failure for `class`, unless the run that produced it was
    /// already cancelled — only the latest run's outcome survives.
    pub fn record(&self, class: ProbeClass, error: ProbeFailureError, run: &CancellationToken) {
        if run.is_cancelled() {
            debug!(
                "dropping {} probe failure from a cancelled run: {error}",
                <&str>::from(class)
            );
            return;
        }
        let mut slots = self.slots.lock().unwrap();
        match class {
            ProbeClass::Safe => slots.safe = Some(error),
            ProbeClass::Privileged => slots.privileged = Some(error),
        }
    }

    pub fn get(&self, class: ProbeClass) -> Option<ProbeFailureError> {
        let slots = self.slots.lock().unwrap();
        match class {
            ProbeClass::Safe => slots.safe.clone(),
            ProbeClass::Privileged => slots.privileged.clone(),
        }
    }

    pub fn reference(&self, class: ProbeClass) -> Option<ProbeErrorRef> {
        self.get(class).map(|e| ProbeErrorRef {
            class: <&str>::from(class).to_string(),
            message: e.to_string(),
        })
    }
}

/// Everything a probe run touches, cheap to clone into the spawned run
/// bodies.
#[derive(Clone)]
struct RunContext {
    model: Arc<Mutex<StorageModel>>,
    configured: Arc<AtomicBool>,
    prober: Arc<dyn Prober>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    errors: Arc<ErrorAggregator>,
    /// Low-level single probe execution; never restarts itself.
    probe_once: Arc<SingleTask>,
    timeout: Duration,
}

pub struct ProbeCoordinator {
    context: RunContext,
    /// Orchestration over the probe classes; new triggers cancel and
    /// restart it.
    probe_all: SingleTask,
}

impl ProbeCoordinator {
    pub fn new(
        model: Arc<Mutex<StorageModel>>,
        configured: Arc<AtomicBool>,
        prober: Arc<dyn Prober>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(ProbeCoordinator {
            context: RunContext {
                model,
                configured,
                prober,
                diagnostics,
                errors: Arc::new(ErrorAggregator::default()),
                probe_once: Arc::new(SingleTask::new("probe-once", RestartPolicy::Reject)),
                timeout,
            },
            probe_all: SingleTask::new("probe", RestartPolicy::CancelAndRestart),
        })
    }

    pub fn errors(&self) -> &ErrorAggregator {
        &self.context.errors
    }

    /// Request a probe run. An active run is cancelled and replaced; the
    /// request itself never fails.
    pub fn trigger(&self) -> StartOutcome {
        let context = self.context.clone();
        match self.probe_all.start(move |token| run_probe(context, token)) {
            Ok(handle) => handle.outcome(),
            Err(err) => {
                // Unreachable for a cancel-and-restart slot; log and move on.
                warn!("probe orchestration slot refused a start: {err:?}");
                StartOutcome::Started
            }
        }
    }

    /// Wait for the run current at call time to finish.
    pub async fn wait(&self) {
        self.probe_all.wait().await;
    }

    pub fn status(&self) -> ProbeStatus {
        if !self.probe_all.has_run() || self.probe_all.is_running() {
            return ProbeStatus::Probing;
        }
        if self.context.errors.get(ProbeClass::Privileged).is_some() {
            return ProbeStatus::Failed;
        }
        ProbeStatus::Done
    }
}

async fn run_probe(context: RunContext, token: CancellationToken) {
    context.errors.clear();
    for class in ProbeClass::iter() {
        if token.is_cancelled() {
            return;
        }

        // The single-execution slot never restarts itself. A lingering
        // execution belongs to a cancelled orchestration, which cancels it
        // on wakeup; wait for the slot to drain rather than interfering.
        let handle = loop {
            let body_context = context.clone();
            let outer = token.clone();
            match context
                .probe_once
                .start(move |inner| probe_once_body(body_context, class, inner, outer))
            {
                Ok(handle) => break handle,
                Err(err) => {
                    debug!("probe execution slot busy ({err:?}), waiting for it to drain");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = context.probe_once.wait() => {}
                    }
                }
            }
        };

        let waited = tokio::select! {
            _ = token.cancelled() => {
                // Cancellation propagates downward into the execution we
                // are waiting on.
                handle.cancel();
                return;
            }
            res = tokio::time::timeout(context.timeout, handle.wait()) => res,
        };

        if waited.is_err() {
            // Abandon the probe call and treat the attempt as failed.
            handle.cancel();
            error!(
                target: "block-discover",
                "probe class {} timed out after {:?}",
                <&str>::from(class),
                context.timeout
            );
            context.errors.record(
                class,
                ProbeFailureError::Timeout {
                    seconds: context.timeout.as_secs(),
                },
                &token,
            );
            continue;
        }

        if context.errors.get(class).is_none() {
            // First class to succeed ends the run.
            break;
        }
    }
}

async fn probe_once_body(
    context: RunContext,
    class: ProbeClass,
    inner: CancellationToken,
    outer: CancellationToken,
) {
    debug!(target: "block-discover", "probing class {}", <&str>::from(class));
    let prober = context.prober.clone();
    let result = tokio::select! {
        _ = inner.cancelled() => return,
        res = tokio::task::spawn_blocking(move || prober.probe(class)) => res,
    };

    let payload = match result {
        Ok(Ok(payload)) => payload,
        Ok(Err(err)) => {
            error!(
                target: "block-discover",
                "block probing failed class={}: {err:#}",
                <&str>::from(class)
            );
            context.errors.record(
                class,
                ProbeFailureError::Execution {
                    message: format!("{err:#}"),
                },
                &outer,
            );
            return;
        }
        Err(join_err) => {
            context.errors.record(
                class,
                ProbeFailureError::Execution {
                    message: format!("probe task panicked: {join_err}"),
                },
                &outer,
            );
            return;
        }
    };

    // A snapshot may land after the user has committed; their plan must not
    // be overwritten with a freshly probed one.
    if context.configured.load(Ordering::SeqCst) {
        debug!("storage decisions are final, discarding probe result");
        return;
    }

    // Diagnostics handoff happens before model application.
    context.diagnostics.note_probe_payload(class, &payload);

    let loaded = context.model.lock().unwrap().load_probe_data(payload);
    if let Err(err) = loaded {
        let failure = match err.kind() {
            ErrorKind::ProbeFailure(pf) => pf.clone(),
            other => ProbeFailureError::LoadSnapshot {
                message: other.to_string(),
            },
        };
        error!(target: "block-discover", "failed to apply probe snapshot: {failure}");
        context.errors.record(class, failure, &outer);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::mpsc;

    use serde_json::Value;

    use crate::model::testutil::{probe_payload_single_disk, GIB};

    use super::*;

    enum Behavior {
        Ok(Value),
        Fail(&'static str),
        /// Block until released, then fail.
        BlockThenFail(mpsc::Receiver<()>),
        /// Block until released, then succeed.
        BlockThenOk(mpsc::Receiver<()>, Value),
    }

    struct MockProber {
        script: Mutex<VecDeque<Behavior>>,
    }

    impl MockProber {
        fn new(script: Vec<Behavior>) -> Arc<Self> {
            Arc::new(MockProber {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl Prober for MockProber {
        fn probe(&self, _class: ProbeClass) -> anyhow::Result<Value> {
            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("probe called more often than scripted");
            match behavior {
                Behavior::Ok(payload) => Ok(payload),
                Behavior::Fail(msg) => anyhow::bail!(msg),
                Behavior::BlockThenFail(rx) => {
                    let _ = rx.recv();
                    anyhow::bail!("released into failure")
                }
                Behavior::BlockThenOk(rx, payload) => {
                    let _ = rx.recv();
                    Ok(payload)
                }
            }
        }
    }

    type Harness = (
        Arc<ProbeCoordinator>,
        Arc<Mutex<StorageModel>>,
        Arc<AtomicBool>,
    );

    fn coordinator(prober: Arc<dyn Prober>, timeout: Duration) -> Harness {
        let model = Arc::new(Mutex::new(StorageModel::default()));
        let configured = Arc::new(AtomicBool::new(false));
        let coordinator = ProbeCoordinator::new(
            model.clone(),
            configured.clone(),
            prober,
            Arc::new(crate::diagnostics::NullSink),
            timeout,
        );
        (coordinator, model, configured)
    }

    fn payload() -> Value {
        probe_payload_single_disk("/dev/vda", 100 * GIB, &[])
    }

    #[tokio::test]
    async fn test_safe_pass_success_loads_model() {
        let prober = MockProber::new(vec![Behavior::Ok(payload())]);
        let (coordinator, model, _) = coordinator(prober, Duration::from_secs(5));

        assert_eq!(coordinator.status(), ProbeStatus::Probing);
        coordinator.trigger();
        coordinator.wait().await;

        assert_eq!(coordinator.status(), ProbeStatus::Done);
        assert!(coordinator.errors().get(ProbeClass::Safe).is_none());
        assert!(model.lock().unwrap().has_snapshot());
    }

    #[tokio::test]
    async fn test_safe_failure_falls_through_to_privileged() {
        let prober = MockProber::new(vec![
            Behavior::Fail("no permission to read filesystem sizing"),
            Behavior::Ok(payload()),
        ]);
        let (coordinator, model, _) = coordinator(prober, Duration::from_secs(5));

        coordinator.trigger();
        coordinator.wait().await;

        // The safe failure is recorded but the run as a whole succeeded.
        assert_eq!(coordinator.status(), ProbeStatus::Done);
        let safe = coordinator.errors().get(ProbeClass::Safe).unwrap();
        assert!(safe.to_string().contains("no permission"));
        assert!(coordinator.errors().get(ProbeClass::Privileged).is_none());
        assert!(model.lock().unwrap().has_snapshot());
    }

    #[tokio::test]
    async fn test_both_classes_failing_is_failed_status() {
        let prober = MockProber::new(vec![
            Behavior::Fail("safe pass failed"),
            Behavior::Fail("privileged pass failed"),
        ]);
        let (coordinator, model, _) = coordinator(prober, Duration::from_secs(5));

        coordinator.trigger();
        coordinator.wait().await;

        assert_eq!(coordinator.status(), ProbeStatus::Failed);
        assert!(coordinator.errors().get(ProbeClass::Safe).is_some());
        let reference = coordinator
            .errors()
            .reference(ProbeClass::Privileged)
            .unwrap();
        assert_eq!(reference.class, "privileged");
        assert!(!model.lock().unwrap().has_snapshot());
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_failure() {
        let (_never_tx, never_rx) = mpsc::channel();
        let (_never_tx2, never_rx2) = mpsc::channel();
        let prober = MockProber::new(vec![
            Behavior::BlockThenFail(never_rx),
            Behavior::BlockThenFail(never_rx2),
        ]);
        let (coordinator, _, _) = coordinator(prober, Duration::from_millis(50));

        coordinator.trigger();
        coordinator.wait().await;

        assert_eq!(coordinator.status(), ProbeStatus::Failed);
        assert!(matches!(
            coordinator.errors().get(ProbeClass::Safe),
            Some(ProbeFailureError::Timeout { .. })
        ));
        assert!(matches!(
            coordinator.errors().get(ProbeClass::Privileged),
            Some(ProbeFailureError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_discards_stale_run_failure() {
        let (release, gate) = mpsc::channel();
        let prober = MockProber::new(vec![
            Behavior::BlockThenFail(gate),
            Behavior::Ok(payload()),
        ]);
        let (coordinator, model, _) = coordinator(prober, Duration::from_secs(5));

        // First run blocks inside the safe pass.
        coordinator.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Retrigger: the first run is cancelled, the second completes.
        let outcome = coordinator.trigger();
        assert_eq!(outcome, StartOutcome::Restarted);
        coordinator.wait().await;

        // Release the stale probe call into its failure; it must not be
        // recorded over the fresh run's clean outcome.
        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(coordinator.status(), ProbeStatus::Done);
        assert!(coordinator.errors().get(ProbeClass::Safe).is_none());
        assert!(coordinator.errors().get(ProbeClass::Privileged).is_none());
        assert!(model.lock().unwrap().has_snapshot());
    }

    #[tokio::test]
    async fn test_configured_model_discards_probe_results() {
        let prober = MockProber::new(vec![Behavior::Ok(payload())]);
        let (coordinator, model, configured) = coordinator(prober, Duration::from_secs(5));

        configured.store(true, Ordering::SeqCst);
        let before = model.lock().unwrap().clone();

        coordinator.trigger();
        coordinator.wait().await;

        // The run succeeded but the model is untouched.
        assert_eq!(coordinator.status(), ProbeStatus::Done);
        assert_eq!(*model.lock().unwrap(), before);
        assert!(!model.lock().unwrap().has_snapshot());
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_the_loop() {
        let (_hold, gate) = mpsc::channel();
        let prober = MockProber::new(vec![Behavior::BlockThenOk(gate, payload())]);
        let (coordinator, model, _) = coordinator(prober, Duration::from_secs(30));

        coordinator.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.probe_all.cancel();

        tokio::time::timeout(Duration::from_secs(1), coordinator.wait())
            .await
            .expect("cancelled run should wind down promptly");
        assert!(!model.lock().unwrap().has_snapshot());
    }
}
