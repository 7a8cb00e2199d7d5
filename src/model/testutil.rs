//! Shared fixtures for model tests.

use serde_json::{json, Value};

use crate::model::{Disk, Partition, PartitionKind, PartitionTable};

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

pub fn part(number: u32, offset: u64, size: u64) -> Partition {
    Partition {
        number,
        offset,
        size,
        kind: PartitionKind::Primary,
        part_uuid: None,
        fs: None,
        boot: false,
        resize: false,
        preserve: true,
        estimated_min_size: None,
        wipe: None,
    }
}

pub fn part_with_min_size(number: u32, offset: u64, size: u64, min: u64) -> Partition {
    Partition {
        estimated_min_size: Some(min),
        ..part(number, offset, size)
    }
}

pub fn disk_with_partitions(
    id: &str,
    size: u64,
    ptable: PartitionTable,
    partitions: Vec<Partition>,
) -> Disk {
    let mut disk = Disk {
        id: id.to_string(),
        path: format!("/dev/{}", id.strip_prefix("disk-").unwrap_or(id)),
        serial: None,
        model: None,
        size,
        ptable,
        raid_member_of: None,
        preserve: true,
        wipe: None,
        partitions: Vec::new(),
    };
    for p in partitions {
        disk.insert_partition(p);
    }
    disk
}

/// DOS-labelled disk with a primary partition, an extended container
/// holding one logical partition, and free space past the container.
/// Layout (for `size` = 100 GiB): primary 1 at [1M, 10G), extended 2 at
/// [10G, 60G), logical 5 at [10G+1M, 30G), free [60G, size).
pub fn dos_disk(size: u64) -> Disk {
    let mut extended = part(2, 10 * GIB, 50 * GIB);
    extended.kind = PartitionKind::Extended;
    let mut logical = part(5, 10 * GIB + MIB, 20 * GIB - MIB);
    logical.kind = PartitionKind::Logical;

    disk_with_partitions(
        "disk-sda",
        size,
        PartitionTable::Dos,
        vec![part(1, MIB, 10 * GIB - MIB), extended, logical],
    )
}

/// Probe payload with one GPT disk. Partition tuples are
/// `(number, offset, size, fstype, boot)`; partitions with a filesystem
/// report an estimated minimum size of half the partition.
pub fn probe_payload_single_disk(
    path: &str,
    size: u64,
    partitions: &[(u32, u64, u64, Option<&str>, bool)],
) -> Value {
    probe_payload(vec![probe_disk(path, size, partitions)])
}

pub fn probe_disk(
    path: &str,
    size: u64,
    partitions: &[(u32, u64, u64, Option<&str>, bool)],
) -> Value {
    let parts: Vec<Value> = partitions
        .iter()
        .map(|(number, offset, size, fstype, boot)| {
            json!({
                "number": number,
                "offset": offset,
                "size": size,
                "fstype": fstype,
                "boot": boot,
                "estimated-min-size": fstype.map(|_| size / 2),
            })
        })
        .collect();
    json!({
        "path": path,
        "serial": format!("SER-{}", path.rsplit('/').next().unwrap_or("disk")),
        "model": "QEMU HARDDISK",
        "size": size,
        "ptable": "gpt",
        "partitions": parts,
    })
}

pub fn probe_payload(disks: Vec<Value>) -> Value {
    json!({
        "bootloader": "uefi",
        "blockdev": disks,
    })
}
