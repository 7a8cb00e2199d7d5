use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A free region on a disk, as referenced by a guided target. Offsets and
/// sizes are bytes; the engine resolves the reference against freshly
/// derived gaps, it never trusts the size blindly.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GapRef {
    /// Byte offset of the gap on its disk.
    pub offset: u64,

    /// Nominal byte size of the gap.
    pub size: u64,
}

/// A high-level partitioning intent, chosen interactively or produced by
/// scenario enumeration. The variant set is closed: every handler matches
/// exhaustively.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GuidedTarget {
    /// Wipe the disk's partition table and install into the full-disk gap.
    Reformat { disk_id: String },

    /// Install into an existing free region without touching other
    /// partitions.
    UseGap { disk_id: String, gap: GapRef },

    /// Shrink an existing partition and install into the space freed
    /// after it.
    Resize {
        disk_id: String,
        partition_number: u32,
        /// New byte size for the shrunk partition.
        new_size: u64,
    },
}

impl GuidedTarget {
    pub fn disk_id(&self) -> &str {
        match self {
            GuidedTarget::Reformat { disk_id }
            | GuidedTarget::UseGap { disk_id, .. }
            | GuidedTarget::Resize { disk_id, .. } => disk_id,
        }
    }
}

impl Display for GuidedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuidedTarget::Reformat { disk_id } => write!(f, "reformat {disk_id}"),
            GuidedTarget::UseGap { disk_id, gap } => {
                write!(f, "use gap at {} on {disk_id}", gap.offset)
            }
            GuidedTarget::Resize {
                disk_id,
                partition_number,
                new_size,
            } => write!(
                f,
                "resize partition {partition_number} on {disk_id} to {new_size}"
            ),
        }
    }
}

/// Layout family for the guided install payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutName {
    /// Single root partition spanning the install gap.
    Direct,

    /// /boot partition plus one volume group with one root logical volume.
    #[default]
    Lvm,
}

/// A guided target paired with the layout to realize inside it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GuidedChoice {
    pub target: GuidedTarget,

    #[serde(default)]
    pub layout: LayoutName,
}
