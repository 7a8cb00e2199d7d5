//! Boot-capability rules: whether a disk carries or can carry the
//! bootloader partition, and what that partition looks like.

use serde::{Deserialize, Serialize};

use keel_api::constants::{BIOS_BOOT_SIZE, DOS_PRIMARY_LIMIT, ESP_SIZE};

use crate::model::{gaps, sizes, Disk, Partition, PartitionKind, PartitionSpec, PartitionTable};

/// Firmware flavor driving the shape of the bootloader partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    #[default]
    Uefi,
    Bios,
}

impl Bootloader {
    pub fn partition_size(self) -> u64 {
        match self {
            Bootloader::Uefi => ESP_SIZE,
            Bootloader::Bios => BIOS_BOOT_SIZE,
        }
    }

    /// Spec of the partition `add_boot_disk` creates.
    pub fn partition_spec(self) -> PartitionSpec {
        match self {
            Bootloader::Uefi => PartitionSpec {
                size: Some(ESP_SIZE),
                fstype: Some("fat32".to_string()),
                mount: Some("/boot/efi".to_string()),
                boot: true,
            },
            Bootloader::Bios => PartitionSpec {
                size: Some(BIOS_BOOT_SIZE),
                fstype: None,
                mount: None,
                boot: true,
            },
        }
    }
}

/// A disk is a boot device when one of its partitions carries the boot flag.
pub fn is_boot_device(disk: &Disk) -> bool {
    disk.partitions().iter().any(|p| p.boot)
}

/// Whether a bootloader partition could live on this disk.
///
/// With reformatting assumed, any disk is fair game: the table gets wiped
/// first. Without, the disk must already carry a boot partition or have
/// room for one; `resize_partition` names a partition whose shrink-to-floor
/// headroom counts towards that room.
pub fn can_be_boot_device(
    disk: &Disk,
    resize_partition: Option<&Partition>,
    with_reformatting: bool,
    bootloader: Bootloader,
) -> bool {
    if with_reformatting {
        return true;
    }
    if is_boot_device(disk) {
        return true;
    }

    if disk.ptable == PartitionTable::Dos && resize_partition.is_none() {
        let primaries = disk
            .partitions()
            .iter()
            .filter(|p| p.kind != PartitionKind::Logical)
            .count() as u32;
        if primaries >= DOS_PRIMARY_LIMIT {
            return false;
        }
    }

    let align = disk.alignment().part_align;
    let mut room = gaps::gaps(disk)
        .iter()
        .filter(|g| !g.in_extended)
        .map(|g| g.usable)
        .max()
        .unwrap_or(0);
    if let Some(partition) = resize_partition {
        let floor = sizes::align_up(
            partition.estimated_min_size.unwrap_or(partition.size),
            align,
        );
        room += partition.size.saturating_sub(floor);
    }

    room >= bootloader.partition_size()
}

#[cfg(test)]
mod tests {
    use crate::model::testutil::{disk_with_partitions, part, part_with_min_size, GIB, MIB};

    use super::*;

    #[test]
    fn test_boot_device_flag() {
        let mut disk = disk_with_partitions("disk-vda", 100 * GIB, PartitionTable::Gpt, vec![]);
        assert!(!is_boot_device(&disk));

        let mut esp = part(1, MIB, 512 * MIB);
        esp.boot = true;
        disk.insert_partition(esp);
        assert!(is_boot_device(&disk));
    }

    #[test]
    fn test_reformatting_makes_any_disk_bootable() {
        let disk = disk_with_partitions(
            "disk-vda",
            10 * GIB,
            PartitionTable::Gpt,
            vec![part(1, 0, 10 * GIB)],
        );
        assert!(can_be_boot_device(&disk, None, true, Bootloader::Uefi));
        assert!(!can_be_boot_device(&disk, None, false, Bootloader::Uefi));
    }

    #[test]
    fn test_room_for_esp_without_reformatting() {
        // 600M free at the end: enough for a 512M ESP.
        let disk = disk_with_partitions(
            "disk-vda",
            10 * GIB,
            PartitionTable::Gpt,
            vec![part(1, 0, 10 * GIB - 600 * MIB)],
        );
        assert!(can_be_boot_device(&disk, None, false, Bootloader::Uefi));

        // 100M free is not, but is plenty for a BIOS grub stub.
        let disk = disk_with_partitions(
            "disk-vdb",
            10 * GIB,
            PartitionTable::Gpt,
            vec![part(1, 0, 10 * GIB - 100 * MIB)],
        );
        assert!(!can_be_boot_device(&disk, None, false, Bootloader::Uefi));
        assert!(can_be_boot_device(&disk, None, false, Bootloader::Bios));
    }

    #[test]
    fn test_resize_headroom_counts() {
        // Full disk, but the partition can shrink far enough to free room
        // for the ESP.
        let disk = disk_with_partitions(
            "disk-vda",
            10 * GIB,
            PartitionTable::Gpt,
            vec![part_with_min_size(1, 0, 10 * GIB, 4 * GIB)],
        );
        assert!(!can_be_boot_device(&disk, None, false, Bootloader::Uefi));
        assert!(can_be_boot_device(
            &disk,
            Some(&disk.partitions()[0]),
            false,
            Bootloader::Uefi
        ));
    }

    #[test]
    fn test_dos_primary_slots_exhausted() {
        let disk = disk_with_partitions(
            "disk-vda",
            100 * GIB,
            PartitionTable::Dos,
            vec![
                part(1, MIB, 10 * GIB),
                part(2, 10 * GIB + MIB, 10 * GIB),
                part(3, 20 * GIB + MIB, 10 * GIB),
                part(4, 30 * GIB + MIB, 10 * GIB),
            ],
        );
        // Plenty of free space, but no primary slot left for the ESP.
        assert!(!can_be_boot_device(&disk, None, false, Bootloader::Uefi));
        assert!(can_be_boot_device(&disk, None, true, Bootloader::Uefi));
    }
}
