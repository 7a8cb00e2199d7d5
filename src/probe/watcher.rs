//! Watches the live block-device event stream and coalesces bursts into a
//! single re-probe: on an event, check (without blocking) whether udev has
//! settled; while it has not, back off briefly instead of probing through
//! the burst; once settled, drain whatever queued up and kick the
//! coordinator once.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use log::debug;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::probe::ProbeCoordinator;

/// A device-topology event. Its occurrence is the trigger; the payload is
/// never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: String,
    pub device: String,
}

/// Non-blocking settle check against the device subsystem.
pub trait SettleCheck: Send + Sync {
    fn is_settled(&self) -> bool;
}

/// The real thing: `udevadm settle -t 0`.
pub struct UdevSettle;

impl SettleCheck for UdevSettle {
    fn is_settled(&self) -> bool {
        blkutils::udevadm::is_settled()
    }
}

/// How long to wait out an unsettled event queue before checking again.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub struct ChangeWatcher {
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    settle: Arc<dyn SettleCheck>,
    coordinator: Arc<ProbeCoordinator>,
    settle_delay: Duration,
}

impl ChangeWatcher {
    pub fn new(
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        settle: Arc<dyn SettleCheck>,
        coordinator: Arc<ProbeCoordinator>,
    ) -> Self {
        ChangeWatcher {
            events,
            settle,
            coordinator,
            settle_delay: SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Watching → settling → watching until cancelled. The event
    /// subscription stays owned for the watcher's whole life; the settling
    /// state only pauses consumption.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                debug!("device event source closed, watcher exiting");
                return;
            };
            debug!("device event: {} {}", event.action, event.device);

            // Settling: while the event queue is mid-burst, defer instead
            // of kicking off a probe for every event.
            while !self.settle.is_settled() {
                debug!("waiting {:?} to let the device event queue settle", self.settle_delay);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.settle_delay) => {}
                }
            }

            // Drain the queued events; their occurrence, not their payload,
            // is the trigger, and one probe covers them all.
            let mut drained = 0;
            while self.events.try_recv().is_ok() {
                drained += 1;
            }
            if drained > 0 {
                debug!("drained {drained} queued device events");
            }

            // An active run is not an error: it just gets replaced.
            let outcome = self.coordinator.trigger();
            debug!("triggered probe run on device event ({outcome:?})");
        }
    }
}

/// Handle keeping the `udevadm monitor` child alive; dropping it tears the
/// subscription down.
pub struct UdevMonitor {
    _child: tokio::process::Child,
}

/// Subscribe to block-device events by following `udevadm monitor`.
pub fn udev_monitor() -> Result<(mpsc::UnboundedReceiver<DeviceEvent>, UdevMonitor), Error> {
    let mut child = tokio::process::Command::new("udevadm")
        .args(blkutils::udevadm::monitor_args())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to start udevadm monitor")?;
    let stdout = child
        .stdout
        .take()
        .context("udevadm monitor has no stdout")?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = parse_monitor_line(&line) {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });

    Ok((rx, UdevMonitor { _child: child }))
}

/// Parse one `udevadm monitor` line, e.g.
/// `UDEV  [4185.223068] add      /devices/pci0000:00/.../sdb1 (block)`.
fn parse_monitor_line(line: &str) -> Option<DeviceEvent> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "UDEV" {
        return None;
    }
    let _timestamp = fields.next()?;
    let action = fields.next()?.to_string();
    let device = fields.next()?.to_string();
    Some(DeviceEvent { action, device })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::Value;

    use crate::model::StorageModel;
    use crate::probe::{ProbeClass, Prober};

    use super::*;

    struct CountingProber {
        calls: AtomicUsize,
    }

    impl Prober for CountingProber {
        fn probe(&self, _class: ProbeClass) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::model::testutil::probe_payload_single_disk(
                "/dev/vda",
                100 << 30,
                &[],
            ))
        }
    }

    struct ScriptedSettle {
        /// false answers to give before reporting settled.
        unsettled: Mutex<usize>,
    }

    impl SettleCheck for ScriptedSettle {
        fn is_settled(&self) -> bool {
            let mut left = self.unsettled.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                false
            } else {
                true
            }
        }
    }

    fn harness(
        unsettled: usize,
    ) -> (
        mpsc::UnboundedSender<DeviceEvent>,
        ChangeWatcher,
        Arc<CountingProber>,
    ) {
        let prober = Arc::new(CountingProber {
            calls: AtomicUsize::new(0),
        });
        let coordinator = ProbeCoordinator::new(
            Arc::new(Mutex::new(StorageModel::default())),
            Arc::new(AtomicBool::new(false)),
            prober.clone(),
            Arc::new(crate::diagnostics::NullSink),
            Duration::from_secs(5),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let settle = Arc::new(ScriptedSettle {
            unsettled: Mutex::new(unsettled),
        });
        let watcher = ChangeWatcher::new(rx, settle, coordinator)
            .with_settle_delay(Duration::from_millis(5));
        (tx, watcher, prober)
    }

    fn event(device: &str) -> DeviceEvent {
        DeviceEvent {
            action: "add".into(),
            device: device.into(),
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_probe() {
        let (tx, watcher, prober) = harness(2);
        let token = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(token.clone()));

        // A burst of events with an initially-unsettled bus.
        for i in 0..5 {
            tx.send(event(&format!("/devices/virtual/block/vd{i}")))
                .unwrap();
        }

        // One probe run covers the whole burst.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);

        // A later lone event triggers again.
        tx.send(event("/devices/virtual/block/vdz")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_watching() {
        let (tx, watcher, prober) = harness(0);
        let token = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(token.clone()));

        token.cancel();
        handle.await.unwrap();

        // Events after cancellation go nowhere.
        let _ = tx.send(event("/devices/virtual/block/vda"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_source_ends_watcher() {
        let (tx, watcher, _prober) = harness(0);
        let token = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(token));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher should exit when the source closes")
            .unwrap();
    }

    #[test]
    fn test_parse_monitor_line() {
        let line = "UDEV  [4185.223068] add      /devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sdb/sdb1 (block)";
        let event = parse_monitor_line(line).unwrap();
        assert_eq!(event.action, "add");
        assert!(event.device.ends_with("sdb1"));

        // Kernel-stage lines and chatter are ignored.
        assert!(parse_monitor_line("KERNEL[4185.2] add /devices/... (block)").is_none());
        assert!(parse_monitor_line("monitor will print the received events for:").is_none());
        assert!(parse_monitor_line("").is_none());
    }
}
