//! The orchestrating surface over the model and the probe lifecycle: the
//! handful of operations an interactive or unattended caller needs, plus
//! the unattended-intent conversion.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel_api::{
    config::{
        DiskMatch, GapRef, GuidedChoice, GuidedTarget, LayoutMode, LayoutSpec, MatchSize,
        StorageAutoinstall,
    },
    constants::PARTITION_ALIGNMENT,
    error::{
        InvalidConfigurationError, NotFoundError, ProbeFailureError, ReportError, StorageError,
    },
    status::{GuidedStatus, ProbeStatus, StorageStatus},
};

use crate::{
    diagnostics::DiagnosticsSink,
    model::{boot, gaps, sizes, StorageModel},
    probe::{
        coordinator::{default_probe_timeout, ProbeCoordinator},
        watcher::{ChangeWatcher, DeviceEvent, SettleCheck},
        ProbeClass, Prober, StartOutcome,
    },
};

pub mod guided;

pub struct EngineConfig {
    /// Size of the install payload; drives the suggested install minimum.
    pub source_size: u64,
    pub probe_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            // Matches a typical compressed-rootfs payload; overridden by
            // the caller when the real source catalog is known.
            source_size: 6 << 30,
            probe_timeout: default_probe_timeout(),
        }
    }
}

pub struct StorageEngine {
    model: Arc<Mutex<StorageModel>>,
    configured: Arc<AtomicBool>,
    coordinator: Arc<ProbeCoordinator>,
    watcher_token: CancellationToken,
    source_size: u64,
    ai_data: Mutex<Option<StorageAutoinstall>>,
}

impl StorageEngine {
    pub fn new(
        prober: Arc<dyn Prober>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let model = Arc::new(Mutex::new(StorageModel::default()));
        let configured = Arc::new(AtomicBool::new(false));
        let coordinator = ProbeCoordinator::new(
            model.clone(),
            configured.clone(),
            prober,
            diagnostics,
            config.probe_timeout,
        );
        Arc::new(StorageEngine {
            model,
            configured,
            coordinator,
            watcher_token: CancellationToken::new(),
            source_size: config.source_size,
            ai_data: Mutex::new(None),
        })
    }

    /// Kick off a probe run. An active run is replaced.
    pub fn trigger_probe(&self) -> StartOutcome {
        self.coordinator.trigger()
    }

    /// Attach the change watcher to a device-event subscription. The
    /// watcher stops when the engine reaches configured.
    pub fn watch(
        &self,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        settle: Arc<dyn SettleCheck>,
    ) -> tokio::task::JoinHandle<()> {
        let watcher = ChangeWatcher::new(events, settle, self.coordinator.clone());
        tokio::spawn(watcher.run(self.watcher_token.clone()))
    }

    pub async fn wait_probed(&self) {
        self.coordinator.wait().await;
    }

    pub fn probe_status(&self) -> ProbeStatus {
        self.coordinator.status()
    }

    /// Copy of the current model, for callers that inspect entities
    /// directly. Readers see either the prior model or a fully-updated
    /// one, never partial mutation.
    pub fn model_snapshot(&self) -> StorageModel {
        self.model.lock().unwrap().clone()
    }

    fn install_min(&self, model: &StorageModel) -> u64 {
        let align = model
            .all_disks()
            .iter()
            .map(|d| d.alignment().part_align)
            .max()
            .unwrap_or(PARTITION_ALIGNMENT);
        sizes::suggested_install_min(self.source_size, align)
    }

    /// Full storage status, optionally waiting out an in-flight probe.
    pub async fn status(&self, wait: bool) -> StorageStatus {
        if wait {
            self.wait_probed().await;
        }
        match self.probe_status() {
            ProbeStatus::Probing => StorageStatus::probing(ProbeStatus::Probing, None),
            ProbeStatus::Failed => StorageStatus::probing(
                ProbeStatus::Failed,
                self.coordinator.errors().reference(ProbeClass::Privileged),
            ),
            ProbeStatus::Done => {
                let model = self.model.lock().unwrap();
                StorageStatus {
                    status: ProbeStatus::Done,
                    error: self.coordinator.errors().reference(ProbeClass::Safe),
                    orig_config: model.orig_actions().to_vec(),
                    config: model.render(true),
                    need_root: !model.is_root_mounted(),
                    need_boot: model.needs_boot_partition(),
                    install_minimum_size: self.install_min(&model),
                }
            }
        }
    }

    /// Feasible guided targets, descending by the space they make
    /// available.
    pub async fn guided_status(&self, wait: bool) -> GuidedStatus {
        if wait {
            self.wait_probed().await;
        }
        let status = self.probe_status();
        let (configured_choice, possible) = match status {
            ProbeStatus::Done => {
                let model = self.model.lock().unwrap();
                let install_min = self.install_min(&model);
                (
                    model.guided_choice().cloned(),
                    guided::enumerate_scenarios(&model, install_min),
                )
            }
            _ => (None, Vec::new()),
        };
        GuidedStatus {
            status,
            error: self.coordinator.errors().reference(ProbeClass::Safe),
            configured: configured_choice,
            possible,
        }
    }

    pub fn apply_guided_choice(&self, choice: &GuidedChoice) -> Result<(), StorageError> {
        let mut model = self.model.lock().unwrap();
        guided::guided(&mut model, choice)
    }

    pub fn reset_model(&self) -> Result<(), StorageError> {
        info!("resetting storage model");
        self.model.lock().unwrap().reset()
    }

    /// Freeze: storage decisions are final. Later probe results are
    /// discarded and the change watcher stands down.
    pub fn set_configured(&self) {
        info!("storage configuration is final");
        self.configured.store(true, Ordering::SeqCst);
        self.watcher_token.cancel();
    }

    /// Stash the unattended intent. A missing section in unattended mode
    /// defaults to a guided LVM reformat.
    pub fn load_autoinstall(&self, data: Option<StorageAutoinstall>, interactive: bool) {
        let data = match data {
            Some(data) => data,
            None if !interactive => StorageAutoinstall {
                layout: Some(LayoutSpec {
                    name: Default::default(),
                    mode: None,
                    disk_match: None,
                }),
                config: None,
            },
            None => StorageAutoinstall::default(),
        };
        *self.ai_data.lock().unwrap() = Some(data);
    }

    /// Replay the unattended intent against the probed model, then freeze.
    /// Any recorded probe failure aborts: unattended storage decisions
    /// must not run on partial hardware facts.
    #[tracing::instrument(name = "autoinstall_storage", skip_all)]
    pub async fn apply_autoinstall(&self) -> Result<(), StorageError> {
        self.wait_probed().await;
        for class in [ProbeClass::Safe, ProbeClass::Privileged] {
            if let Some(failure) = self.coordinator.errors().get(class) {
                return Err(StorageError::new(failure));
            }
        }

        self.convert_autoinstall()?;

        {
            let model = self.model.lock().unwrap();
            if !model.is_root_mounted() {
                return Err(InvalidConfigurationError::RootNotMounted.into());
            }
            if model.needs_boot_partition() {
                return Err(InvalidConfigurationError::MissingBootPartition.into());
            }
        }
        self.set_configured();
        Ok(())
    }

    fn convert_autoinstall(&self) -> Result<(), StorageError> {
        let data = self.ai_data.lock().unwrap().clone().unwrap_or_default();
        if let Some(layout) = &data.layout {
            if data.config.is_some() {
                warn!(
                    "the storage section should not contain both 'layout' and 'config', \
                     using 'layout'"
                );
            }
            self.run_autoinstall_guided(layout)
        } else if let Some(config) = &data.config {
            self.model.lock().unwrap().apply_config_actions(config)
        } else {
            Ok(())
        }
    }

    fn run_autoinstall_guided(&self, layout: &LayoutSpec) -> Result<(), StorageError> {
        let mode = layout.mode().map_err(StorageError::new)?;
        let mut model = self.model.lock().unwrap();

        let target = match mode {
            LayoutMode::ReformatDisk => {
                let matcher = layout.disk_match.clone().unwrap_or(DiskMatch {
                    size: Some(MatchSize::Largest),
                    ..Default::default()
                });
                let disk_id = disk_for_match(&model, &matcher)?;
                GuidedTarget::Reformat { disk_id }
            }
            LayoutMode::UseGap => {
                let bootable: Vec<_> = model
                    .all_disks()
                    .iter()
                    .filter(|d| boot::can_be_boot_device(d, None, false, model.bootloader))
                    .collect();
                let gap = gaps::largest_gap(bootable.into_iter())
                    .structured(NotFoundError::NoGapLargeEnough)?;
                GuidedTarget::UseGap {
                    disk_id: gap.disk_id.clone(),
                    gap: GapRef {
                        offset: gap.offset,
                        size: gap.size,
                    },
                }
            }
        };

        info!(
            "autoinstall: running guided {:?} install in mode {mode} using {target}",
            layout.name
        );
        guided::guided(
            &mut model,
            &GuidedChoice {
                target,
                layout: layout.name,
            },
        )
    }

    /// Surface a recorded probe failure to a caller that asked for it.
    pub fn probe_failure(&self, class: ProbeClass) -> Option<ProbeFailureError> {
        self.coordinator.errors().get(class)
    }
}

/// Pick the disk matching the criteria. All provided criteria must hold;
/// `size` breaks remaining ties (first match wins on equal sizes).
pub fn disk_for_match(model: &StorageModel, matcher: &DiskMatch) -> Result<String, StorageError> {
    let glob_matches = |pattern: &Option<String>, value: &Option<String>| match pattern {
        None => true,
        Some(pattern) => match glob::Pattern::new(pattern) {
            Ok(pattern) => value
                .as_deref()
                .map(|v| pattern.matches(v))
                .unwrap_or(false),
            Err(e) => {
                warn!("invalid disk match pattern '{pattern}': {e}");
                false
            }
        },
    };

    let candidates: Vec<_> = model
        .all_disks()
        .iter()
        .filter(|d| glob_matches(&matcher.serial, &d.serial))
        .filter(|d| glob_matches(&matcher.model, &d.model))
        .filter(|d| {
            matcher
                .path
                .as_ref()
                .map(|p| p.as_os_str() == std::ffi::OsStr::new(&d.path))
                .unwrap_or(true)
        })
        .collect();

    let picked = match matcher.size {
        Some(MatchSize::Largest) => candidates
            .iter()
            .fold(None, |best: Option<&&crate::model::Disk>, d| match best {
                Some(b) if b.size >= d.size => best,
                _ => Some(d),
            }),
        Some(MatchSize::Smallest) => candidates
            .iter()
            .fold(None, |best: Option<&&crate::model::Disk>, d| match best {
                Some(b) if b.size <= d.size => best,
                _ => Some(d),
            }),
        None => candidates.first(),
    };

    picked
        .map(|d| d.id.clone())
        .structured(NotFoundError::NoMatchingDisk)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use keel_api::error::ErrorKind;

    use crate::diagnostics::NullSink;
    use crate::model::testutil::{probe_disk, probe_payload, probe_payload_single_disk, GIB, MIB};

    use super::*;

    struct StaticProber {
        payload: Value,
    }

    impl Prober for StaticProber {
        fn probe(&self, _class: ProbeClass) -> anyhow::Result<Value> {
            Ok(self.payload.clone())
        }
    }

    fn engine_with(payload: Value) -> Arc<StorageEngine> {
        StorageEngine::new(
            Arc::new(StaticProber { payload }),
            Arc::new(NullSink),
            EngineConfig {
                source_size: 6 * GIB,
                probe_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_status_flow() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        assert_eq!(engine.probe_status(), ProbeStatus::Probing);

        engine.trigger_probe();
        let status = engine.status(true).await;
        assert_eq!(status.status, ProbeStatus::Done);
        assert!(status.need_root);
        assert!(status.need_boot);
        assert_eq!(
            status.install_minimum_size,
            sizes::suggested_install_min(6 * GIB, PARTITION_ALIGNMENT)
        );
        assert!(!status.config.is_empty());
        assert_eq!(status.config, status.orig_config);
    }

    #[tokio::test]
    async fn test_guided_flow_and_reset() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        engine.trigger_probe();
        engine.wait_probed().await;

        let guided_status = engine.guided_status(false).await;
        assert_eq!(guided_status.possible.len(), 1);
        assert!(guided_status.configured.is_none());

        let choice = GuidedChoice {
            target: guided_status.possible[0].target.clone(),
            layout: Default::default(),
        };
        engine.apply_guided_choice(&choice).unwrap();

        let status = engine.status(false).await;
        assert!(!status.need_root);
        assert!(!status.need_boot);
        assert_ne!(status.config, status.orig_config);

        let guided_status = engine.guided_status(false).await;
        assert_eq!(guided_status.configured, Some(choice));

        engine.reset_model().unwrap();
        let status = engine.status(false).await;
        assert!(status.need_root);
        assert_eq!(status.config, status.orig_config);
    }

    #[tokio::test]
    async fn test_configured_freezes_model_against_probes() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        engine.trigger_probe();
        engine.wait_probed().await;
        engine
            .apply_guided_choice(&GuidedChoice {
                target: GuidedTarget::Reformat {
                    disk_id: "disk-vda".into(),
                },
                layout: Default::default(),
            })
            .unwrap();

        engine.set_configured();
        let before = engine.model_snapshot();

        // A probe completing after the freeze must not alter the model.
        engine.trigger_probe();
        engine.wait_probed().await;
        assert_eq!(engine.model_snapshot(), before);
    }

    #[tokio::test]
    async fn test_autoinstall_defaults_to_guided_lvm() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        engine.load_autoinstall(None, false);
        engine.trigger_probe();
        engine.apply_autoinstall().await.unwrap();

        let model = engine.model_snapshot();
        assert!(model.is_root_mounted());
        assert!(!model.needs_boot_partition());
        assert!(model.volume_group("ubuntu-vg").is_ok());

        // Configured is terminal: a further probe leaves the plan alone.
        let before = engine.model_snapshot();
        engine.trigger_probe();
        engine.wait_probed().await;
        assert_eq!(engine.model_snapshot(), before);
    }

    #[tokio::test]
    async fn test_autoinstall_layout_wins_over_config() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        let doc: StorageAutoinstall = serde_yaml::from_str(indoc::indoc! {r#"
            layout:
              name: lvm
            config:
              - type: disk
                id: disk-vda
                path: /dev/vda
                ptable: gpt
                preserve: true
        "#})
        .unwrap();
        engine.load_autoinstall(Some(doc), false);
        engine.trigger_probe();
        engine.apply_autoinstall().await.unwrap();

        // The guided layout ran; the literal config (which mounts nothing)
        // did not.
        assert!(engine.model_snapshot().volume_group("ubuntu-vg").is_ok());
    }

    #[tokio::test]
    async fn test_autoinstall_unknown_mode_is_invalid_configuration() {
        let engine = engine_with(probe_payload_single_disk("/dev/vda", 250 * GIB, &[]));
        let doc: StorageAutoinstall =
            serde_yaml::from_str("layout:\n  name: lvm\n  mode: resize\n").unwrap();
        engine.load_autoinstall(Some(doc), false);
        engine.trigger_probe();

        let err = engine.apply_autoinstall().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_autoinstall_use_gap_mode() {
        let engine = engine_with(probe_payload_single_disk(
            "/dev/vda",
            250 * GIB,
            &[(1, MIB, 50 * GIB, Some("ext4"), false)],
        ));
        let doc: StorageAutoinstall =
            serde_yaml::from_str("layout:\n  name: direct\n  mode: use_gap\n").unwrap();
        engine.load_autoinstall(Some(doc), false);
        engine.trigger_probe();
        engine.apply_autoinstall().await.unwrap();

        let model = engine.model_snapshot();
        let disk = model.disk("disk-vda").unwrap();
        // The probed partition survived; the install landed in the gap.
        assert!(disk.partition(1).unwrap().preserve);
        assert!(model.is_root_mounted());
    }

    #[tokio::test]
    async fn test_autoinstall_aborts_on_probe_failure() {
        struct FailingProber;
        impl Prober for FailingProber {
            fn probe(&self, _class: ProbeClass) -> anyhow::Result<Value> {
                anyhow::bail!("hardware access denied")
            }
        }
        let engine = StorageEngine::new(
            Arc::new(FailingProber),
            Arc::new(NullSink),
            EngineConfig {
                source_size: 6 * GIB,
                probe_timeout: Duration::from_secs(5),
            },
        );
        engine.load_autoinstall(None, false);
        engine.trigger_probe();

        let err = engine.apply_autoinstall().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ProbeFailure(_)));
        assert!(engine.probe_failure(ProbeClass::Safe).is_some());
    }

    #[test]
    fn test_disk_for_match() {
        let mut model = StorageModel::default();
        model
            .load_probe_data(probe_payload(vec![
                probe_disk("/dev/vda", 100 * GIB, &[]),
                probe_disk("/dev/vdb", 500 * GIB, &[]),
                probe_disk("/dev/vdc", 50 * GIB, &[]),
            ]))
            .unwrap();

        let largest = DiskMatch {
            size: Some(MatchSize::Largest),
            ..Default::default()
        };
        assert_eq!(disk_for_match(&model, &largest).unwrap(), "disk-vdb");

        let smallest = DiskMatch {
            size: Some(MatchSize::Smallest),
            ..Default::default()
        };
        assert_eq!(disk_for_match(&model, &smallest).unwrap(), "disk-vdc");

        // Serial globs; the fixtures use SER-<name>.
        let by_serial = DiskMatch {
            serial: Some("SER-vda*".into()),
            ..Default::default()
        };
        assert_eq!(disk_for_match(&model, &by_serial).unwrap(), "disk-vda");

        let by_path = DiskMatch {
            path: Some("/dev/vdb".into()),
            ..Default::default()
        };
        assert_eq!(disk_for_match(&model, &by_path).unwrap(), "disk-vdb");

        let no_match = DiskMatch {
            serial: Some("NOPE-*".into()),
            ..Default::default()
        };
        assert!(matches!(
            disk_for_match(&model, &no_match).unwrap_err().kind(),
            ErrorKind::NotFound(_)
        ));
    }

    #[test]
    fn test_disk_for_match_largest_tie_keeps_first() {
        let mut model = StorageModel::default();
        model
            .load_probe_data(probe_payload(vec![
                probe_disk("/dev/vda", 100 * GIB, &[]),
                probe_disk("/dev/vdb", 100 * GIB, &[]),
            ]))
            .unwrap();
        let matcher = DiskMatch {
            size: Some(MatchSize::Largest),
            ..Default::default()
        };
        assert_eq!(disk_for_match(&model, &matcher).unwrap(), "disk-vda");
    }
}
