use serde::{Deserialize, Serialize};

use crate::primitives::bytes::ByteCount;

/// One step of the rendered storage plan, in dependency order. The stream is
/// consumed by the external applier that performs the actual writes; it is
/// also the literal `config:` form accepted from an unattended document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Disk {
        id: String,
        path: String,
        ptable: String,
        preserve: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wipe: Option<String>,
    },
    Partition {
        id: String,
        /// Action id of the owning disk.
        device: String,
        number: u32,
        offset: u64,
        size: ByteCount,
        #[serde(skip_serializing_if = "Option::is_none")]
        flag: Option<String>,
        preserve: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resize: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wipe: Option<String>,
    },
    Format {
        id: String,
        /// Action id of the partition or logical volume being formatted.
        volume: String,
        fstype: String,
        preserve: bool,
    },
    Mount {
        id: String,
        /// Action id of the format being mounted.
        device: String,
        path: String,
    },
    LvmVolgroup {
        id: String,
        name: String,
        /// Action ids of the member partitions.
        devices: Vec<String>,
    },
    LvmLogvol {
        id: String,
        name: String,
        /// Action id of the owning volume group.
        volgroup: String,
        size: ByteCount,
    },
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::Disk { id, .. }
            | Action::Partition { id, .. }
            | Action::Format { id, .. }
            | Action::Mount { id, .. }
            | Action::LvmVolgroup { id, .. }
            | Action::LvmLogvol { id, .. } => id,
        }
    }
}
