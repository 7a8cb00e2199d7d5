//! Policy constants shared by the engine and its callers.

/// Minimum byte boundary for partition offsets and sizes.
pub const PARTITION_ALIGNMENT: u64 = 1 << 20;

/// Reserved spacer preceding a logical partition on a DOS table (EBR).
pub const EBR_SPACE: u64 = 1 << 20;

/// Primary partition slots on a DOS table.
pub const DOS_PRIMARY_LIMIT: u32 = 4;

/// Partition entries in a standard GPT header.
pub const GPT_PARTITION_LIMIT: u32 = 128;

/// First partition number used for logical partitions on a DOS table.
pub const FIRST_LOGICAL_NUMBER: u32 = 5;

/// EFI system partition size used when a boot partition must be added.
pub const ESP_SIZE: u64 = 512 << 20;

/// BIOS grub partition size on non-EFI systems.
pub const BIOS_BOOT_SIZE: u64 = 1 << 20;

/// Fixed size of the /boot filesystem carved off for an LVM layout.
pub const BOOT_FS_SIZE: u64 = 1 << 30;

/// Headroom added on top of the install payload when computing the
/// suggested install minimum.
pub const INSTALL_HEADROOM: u64 = 2 << 30;

/// LVM allocation chunk; logical volume sizes are floored to this.
pub const LVM_CHUNK_SIZE: u64 = 4 << 20;

/// Per-physical-volume LVM metadata overhead.
pub const LVM_OVERHEAD: u64 = 1 << 20;

/// Base name for auto-named volume groups; suffixed -1, -2, … on collision.
pub const DEFAULT_VG_NAME: &str = "ubuntu-vg";

/// Name of the single logical volume created by the guided LVM layout.
pub const DEFAULT_LV_NAME: &str = "ubuntu-lv";

/// Diagnostics artifact name for the unprivileged probe payload.
pub const PROBE_DATA_FILE: &str = "probe-data.json";

/// Diagnostics artifact name for the privileged (block-device-only) payload.
pub const PROBE_DATA_RESTRICTED_FILE: &str = "probe-data-restricted.json";
