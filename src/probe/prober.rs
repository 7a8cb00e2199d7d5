//! Default prober built on lsblk. The safe pass gathers everything the
//! planner wants (filesystems, usage, serials); the privileged pass keeps
//! to bare block-device facts, for retrying enumeration with elevated
//! privileges after the safe pass failed.

use std::path::Path;

use anyhow::{Context, Error};
use serde_json::{json, Value};

use blkutils::lsblk::{self, BlockDevice};

use crate::probe::{ProbeClass, Prober};

/// ESP type GUID from the discoverable partitions specification.
const ESP_TYPE_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// MBR bootable flag as lsblk reports it.
const DOS_BOOT_FLAG: &str = "0x80";

pub struct LsblkProber;

impl Prober for LsblkProber {
    fn probe(&self, class: ProbeClass) -> Result<Value, Error> {
        let devices = lsblk::list().context("block device enumeration failed")?;
        Ok(build_payload(&devices, class, efi_firmware()))
    }
}

fn efi_firmware() -> bool {
    Path::new("/sys/firmware/efi").exists()
}

fn partition_number(name: &str) -> Option<u32> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.chars().rev().collect::<String>().parse().ok()
}

fn build_payload(devices: &[BlockDevice], class: ProbeClass, efi: bool) -> Value {
    let mut disks = Vec::new();
    for device in devices.iter().filter(|d| d.is_disk()) {
        let sector = device.logical_sector_size.unwrap_or(512);
        let raid = device
            .children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|c| c.device_type.starts_with("raid"))
            .map(|c| c.name.clone());

        let partitions: Vec<Value> = device
            .children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|c| c.is_partition())
            .filter_map(|part| {
                let number = partition_number(&part.name)?;
                let offset = part.start? * sector;
                let boot = part.parttype.as_deref() == Some(ESP_TYPE_GUID)
                    || part.partflags.as_deref() == Some(DOS_BOOT_FLAG);
                let mut entry = json!({
                    "number": number,
                    "offset": offset,
                    "size": part.size,
                    "boot": boot,
                    "partuuid": part.part_uuid,
                });
                if class == ProbeClass::Safe {
                    entry["fstype"] = json!(part.fstype);
                    // The occupied floor: what the filesystem reports as
                    // used, with slack for metadata growth during the
                    // shrink itself.
                    entry["estimated-min-size"] =
                        json!(part.fsused.map(|used| used + used / 10));
                }
                Some(entry)
            })
            .collect();

        let mut disk = json!({
            "path": device.path.clone().unwrap_or(format!("/dev/{}", device.name)),
            "size": device.size,
            "ptable": device.partition_table,
            "raid-member-of": raid,
            "partitions": partitions,
        });
        if class == ProbeClass::Safe {
            disk["serial"] = json!(device.serial);
            disk["model"] = json!(device.model);
        }
        disks.push(disk);
    }

    json!({
        "bootloader": if efi { "uefi" } else { "bios" },
        "blockdev": disks,
    })
}
