//! Pure sizing policy: install minimums, boot partition sizes, logical
//! volume sizing tiers, and resize feasibility. No model mutation.

use keel_api::constants::{BOOT_FS_SIZE, INSTALL_HEADROOM, LVM_CHUNK_SIZE};

pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    (value / alignment) * alignment
}

/// Smallest target the install payload can be guided into: the payload plus
/// a fixed headroom margin, rounded up to the partition alignment.
pub fn suggested_install_min(source_size: u64, alignment: u64) -> u64 {
    align_up(source_size + INSTALL_HEADROOM, alignment)
}

/// Size of the /boot filesystem carved off during a guided LVM layout.
/// Fixed policy; the span it is carved from does not influence it.
pub fn boot_fs_size(_available: u64) -> u64 {
    BOOT_FS_SIZE
}

/// Root logical volume sizing policy. Filling a small group completely is
/// fine; on larger groups leave room so the user does not hit out-of-space
/// sooner than they would expect. Floored to the LVM allocation chunk.
pub fn lv_size_policy(vg_size: u64) -> u64 {
    let lv_size = if vg_size < 10 << 30 {
        // Use all of a small (<10G) group.
        vg_size
    } else if vg_size < 20 << 30 {
        // Use 10G of a smallish (<20G) group.
        10 << 30
    } else if vg_size < 200 << 30 {
        // Use half of a larger (<200G) group.
        vg_size / 2
    } else {
        // Use at most 100G of a large group.
        100 << 30
    };
    align_down(lv_size, LVM_CHUNK_SIZE)
}

/// Bounds for shrinking an existing partition to make room for an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    /// Smallest size the partition can shrink to (its occupied floor,
    /// aligned up).
    pub minimum: u64,

    /// Suggested new size: half the partition, clamped into
    /// `[minimum, maximum]`.
    pub recommended: u64,

    /// Largest size the partition may keep while still freeing the install
    /// minimum.
    pub maximum: u64,

    /// Bytes available to the install if the partition shrinks to
    /// `minimum`.
    pub install_max: u64,
}

/// Resize feasibility. `None` when the partition cannot free enough space
/// for the install minimum, or when its occupied floor is unknown.
pub fn calculate_resize(
    estimated_min_size: Option<u64>,
    part_size: u64,
    install_min: u64,
    alignment: u64,
) -> Option<ResizePlan> {
    let occupied = estimated_min_size?;
    let minimum = align_up(occupied.max(alignment), alignment);
    if minimum > part_size {
        return None;
    }

    let maximum = align_down(part_size.checked_sub(install_min)?, alignment);
    if maximum < minimum {
        return None;
    }

    let recommended = align_up(part_size / 2, alignment).clamp(minimum, maximum);

    Some(ResizePlan {
        minimum,
        recommended,
        maximum,
        install_max: part_size - minimum,
    })
}
