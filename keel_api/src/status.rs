use serde::{Deserialize, Serialize};

use crate::config::{actions::Action, guided::GuidedChoice, guided::GuidedTarget};

/// Lifecycle of the hardware probe as seen by callers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStatus {
    /// No completed run yet, or a run is in flight.
    Probing,
    /// The privileged fallback pass also failed; no usable snapshot.
    Failed,
    /// A snapshot was applied to the model.
    Done,
}

/// Reference to a recorded probe failure. The failure itself stays in the
/// aggregator; callers only get enough to report it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeErrorRef {
    pub class: String,
    pub message: String,
}

/// Full storage status returned from the query boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub status: ProbeStatus,

    /// The most relevant recorded probe failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeErrorRef>,

    /// Plan as loaded from the probe snapshot, before any mutation.
    #[serde(default)]
    pub orig_config: Vec<Action>,

    /// Current plan, including guided mutations.
    #[serde(default)]
    pub config: Vec<Action>,

    /// No filesystem is mounted at / yet.
    pub need_root: bool,

    /// No disk carries a bootloader partition yet.
    pub need_boot: bool,

    /// Suggested install minimum in bytes.
    pub install_minimum_size: u64,
}

impl StorageStatus {
    /// Placeholder status while a probe is still in flight or has failed.
    pub fn probing(status: ProbeStatus, error: Option<ProbeErrorRef>) -> Self {
        StorageStatus {
            status,
            error,
            orig_config: Vec::new(),
            config: Vec::new(),
            need_root: true,
            need_boot: true,
            install_minimum_size: 0,
        }
    }
}

/// One feasible guided target, paired with the storage it would make
/// available to the install.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GuidedScenario {
    /// Bytes available to the install payload under this target.
    pub capacity: u64,

    pub target: GuidedTarget,
}

/// Scenario listing returned from the query boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuidedStatus {
    pub status: ProbeStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeErrorRef>,

    /// The choice already applied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured: Option<GuidedChoice>,

    /// Feasible targets, descending by capacity.
    #[serde(default)]
    pub possible: Vec<GuidedScenario>,
}
