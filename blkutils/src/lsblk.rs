use std::{path::Path, process::Command};

use anyhow::{Context, Error};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exe::RunAndCheck;

/// Columns requested from lsblk. Kept to what the prober consumes.
const OUTPUT_COLUMNS: &str =
    "NAME,PATH,TYPE,SIZE,START,LOG-SEC,PTTYPE,PARTTYPE,PARTUUID,FSTYPE,MOUNTPOINT,FSUSED,PARTFLAGS,SERIAL,MODEL";

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
struct LsBlkOutput {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: String,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub device_type: String,
    pub size: u64,
    /// Start sector; present on partitions.
    pub start: Option<u64>,
    #[serde(rename = "log-sec")]
    pub logical_sector_size: Option<u64>,
    #[serde(rename = "pttype")]
    pub partition_table: Option<String>,
    /// GPT partition type GUID, lowercase.
    pub parttype: Option<String>,
    #[serde(rename = "partuuid")]
    pub part_uuid: Option<Uuid>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub fsused: Option<u64>,
    pub partflags: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<BlockDevice>>,
}

impl BlockDevice {
    pub fn is_disk(&self) -> bool {
        self.device_type == "disk"
    }

    pub fn is_partition(&self) -> bool {
        self.device_type == "part"
    }

    pub fn is_raid_member(&self) -> bool {
        self.children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.device_type.starts_with("raid"))
    }
}

/// Enumerate all block devices.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    run_lsblk(None)
}

/// Enumerate one device and its children.
pub fn run(device_path: impl AsRef<Path>) -> Result<Vec<BlockDevice>, Error> {
    run_lsblk(Some(device_path.as_ref()))
}

fn run_lsblk(device_path: Option<&Path>) -> Result<Vec<BlockDevice>, Error> {
    let mut command = Command::new("lsblk");
    command
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(OUTPUT_COLUMNS);
    if let Some(path) = device_path {
        command.arg(path);
    }

    let result = command
        .output_and_check()
        .context("Failed to execute lsblk")?;

    let parsed = parse_lsblk_output(result.as_str());
    if parsed.is_err() {
        warn!("lsblk output: {result}");
    }

    parsed
}

fn parse_lsblk_output(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    Ok(parsed.blockdevices)
}
