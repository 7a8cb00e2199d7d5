//! The in-memory storage model: the entity graph built from a probe
//! snapshot, plus the mutation primitives the guided partitioner drives.
//! Gaps are derived on demand by [`gaps`]; they are never stored here.

use std::fmt::Display;

use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use keel_api::{
    config::{Action, GuidedChoice},
    constants::{
        DEFAULT_VG_NAME, DOS_PRIMARY_LIMIT, EBR_SPACE, FIRST_LOGICAL_NUMBER, GPT_PARTITION_LIMIT,
        LVM_CHUNK_SIZE, LVM_OVERHEAD, PARTITION_ALIGNMENT,
    },
    error::{
        InvalidGeometryError, InvariantViolationError, NameConflictError, NotFoundError,
        ProbeFailureError, ReportError, StorageError,
    },
};

pub mod boot;
pub mod gaps;
pub mod sizes;

#[cfg(test)]
pub(crate) mod testutil;

pub use boot::Bootloader;
pub use gaps::Gap;

/// Partition table flavor of a disk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionTable {
    #[default]
    Gpt,
    Dos,
}

impl PartitionTable {
    pub fn alignment(&self) -> AlignmentData {
        match self {
            PartitionTable::Gpt => AlignmentData {
                part_align: PARTITION_ALIGNMENT,
                ebr_space: 0,
                primary_limit: GPT_PARTITION_LIMIT,
            },
            PartitionTable::Dos => AlignmentData {
                part_align: PARTITION_ALIGNMENT,
                ebr_space: EBR_SPACE,
                primary_limit: DOS_PRIMARY_LIMIT,
            },
        }
    }

    pub fn supports_extended(&self) -> bool {
        matches!(self, PartitionTable::Dos)
    }
}

impl Display for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PartitionTable::Gpt => "gpt",
            PartitionTable::Dos => "msdos",
        })
    }
}

/// Geometry parameters of a partition table flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentData {
    /// Byte boundary partition offsets and sizes must respect.
    pub part_align: u64,
    /// Reserved spacer preceding a new logical partition (zero on GPT).
    pub ebr_space: u64,
    /// Partition slots available outside an extended container.
    pub primary_limit: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    #[default]
    Primary,
    /// DOS container partition; excluded from the flat layout walk.
    Extended,
    /// Lives inside the extended container, numbered from 5.
    Logical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WipePolicy {
    Superblock,
    SuperblockRecursive,
}

impl Display for WipePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WipePolicy::Superblock => "superblock",
            WipePolicy::SuperblockRecursive => "superblock-recursive",
        })
    }
}

/// Filesystem descriptor attached to a partition or logical volume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Filesystem {
    pub fstype: String,
    /// Mount path in the plan; probed filesystems carry none until the plan
    /// assigns one.
    pub mount: Option<String>,
    /// Probed from disk rather than planned by us.
    pub preserve: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
    pub kind: PartitionKind,
    /// Table-assigned identity; `None` until the applier creates the
    /// partition for real.
    pub part_uuid: Option<Uuid>,
    pub fs: Option<Filesystem>,
    pub boot: bool,
    /// Pending shrink: the applier must resize the filesystem before the
    /// table entry changes.
    pub resize: bool,
    /// Existed on disk before planning started.
    pub preserve: bool,
    /// Probed lower bound on the occupied bytes; `None` when unknown.
    pub estimated_min_size: Option<u64>,
    pub wipe: Option<WipePolicy>,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub id: String,
    pub path: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub size: u64,
    pub ptable: PartitionTable,
    /// RAID array this whole disk is a member of, if any.
    pub raid_member_of: Option<String>,
    /// Partition table survives from probe time (false after a reformat).
    pub preserve: bool,
    pub wipe: Option<WipePolicy>,
    partitions: Vec<Partition>,
}

impl Disk {
    pub fn alignment(&self) -> AlignmentData {
        self.ptable.alignment()
    }

    /// Partitions ordered by offset.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, number: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.number == number)
    }

    fn partition_mut(&mut self, number: u32) -> Option<&mut Partition> {
        self.partitions.iter_mut().find(|p| p.number == number)
    }

    pub(crate) fn insert_partition(&mut self, partition: Partition) {
        let at = self
            .partitions
            .partition_point(|p| p.offset <= partition.offset);
        self.partitions.insert(at, partition);
    }

    fn next_partition_number(&self, kind: PartitionKind) -> Result<u32, StorageError> {
        let used = |n: u32| self.partitions.iter().any(|p| p.number == n);
        match kind {
            PartitionKind::Primary | PartitionKind::Extended => (1..=self
                .alignment()
                .primary_limit)
                .find(|n| !used(*n))
                .structured(InvalidGeometryError::PartitionNumbersExhausted {
                    disk: self.id.clone(),
                }),
            PartitionKind::Logical => {
                let next = self
                    .partitions
                    .iter()
                    .filter(|p| p.kind == PartitionKind::Logical)
                    .map(|p| p.number)
                    .max()
                    .map(|n| n + 1)
                    .unwrap_or(FIRST_LOGICAL_NUMBER);
                Ok(next)
            }
        }
    }

    /// Offset the partition `number` may grow up to: the start of the next
    /// partition, the end of the extended container for logicals, or the
    /// end of the disk.
    fn growth_boundary(&self, number: u32) -> u64 {
        let Some(partition) = self.partition(number) else {
            return self.size;
        };
        let mut boundary = self
            .partitions
            .iter()
            .filter(|p| p.kind != PartitionKind::Extended && p.offset > partition.offset)
            .map(|p| p.offset)
            .min()
            .unwrap_or(self.size);
        if partition.kind == PartitionKind::Logical {
            if let Some(ext) = self
                .partitions
                .iter()
                .find(|p| p.kind == PartitionKind::Extended)
            {
                boundary = boundary.min(ext.end());
            }
        }
        boundary
    }
}

/// Reference to a partition from outside its disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionRef {
    pub disk_id: String,
    pub number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub size: u64,
    pub fs: Option<Filesystem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub name: String,
    pub devices: Vec<PartitionRef>,
    logical_volumes: Vec<LogicalVolume>,
}

impl VolumeGroup {
    pub fn logical_volumes(&self) -> &[LogicalVolume] {
        &self.logical_volumes
    }
}

/// Requested shape of a new partition. A `None` size means "fill the gap".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSpec {
    pub size: Option<u64>,
    pub fstype: Option<String>,
    pub mount: Option<String>,
    pub boot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeGroupSpec {
    /// Explicit name; `None` auto-names `ubuntu-vg`, `ubuntu-vg-1`, ….
    pub name: Option<String>,
    pub devices: Vec<PartitionRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeSpec {
    pub name: String,
    pub size: u64,
    pub fstype: Option<String>,
    pub mount: Option<String>,
}

/// Raw probe payload schema. The payload travels as opaque JSON up to this
/// loader; everything else treats it as a `Value`.
#[derive(Deserialize, Debug)]
struct ProbePayload {
    #[serde(default)]
    bootloader: Option<Bootloader>,
    blockdev: Vec<ProbeDisk>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct ProbeDisk {
    path: String,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    model: Option<String>,
    size: u64,
    #[serde(default)]
    ptable: Option<PartitionTable>,
    #[serde(default)]
    raid_member_of: Option<String>,
    #[serde(default)]
    partitions: Vec<ProbePartition>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct ProbePartition {
    number: u32,
    offset: u64,
    size: u64,
    #[serde(default)]
    kind: PartitionKind,
    #[serde(default)]
    partuuid: Option<Uuid>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    boot: bool,
    #[serde(default)]
    estimated_min_size: Option<u64>,
}

/// The entity graph plus everything needed to rebuild it: the raw snapshot
/// it was loaded from and the rendering of that pristine state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageModel {
    pub bootloader: Bootloader,
    disks: Vec<Disk>,
    volume_groups: Vec<VolumeGroup>,
    probe_data: Option<Value>,
    orig_actions: Vec<Action>,
    guided_choice: Option<GuidedChoice>,
}

impl StorageModel {
    pub fn all_disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn volume_groups(&self) -> &[VolumeGroup] {
        &self.volume_groups
    }

    pub fn disk(&self, id: &str) -> Result<&Disk, StorageError> {
        self.disks
            .iter()
            .find(|d| d.id == id)
            .structured(NotFoundError::Disk { id: id.to_string() })
    }

    fn disk_mut(&mut self, id: &str) -> Result<&mut Disk, StorageError> {
        self.disks
            .iter_mut()
            .find(|d| d.id == id)
            .structured(NotFoundError::Disk { id: id.to_string() })
    }

    pub fn partition(&self, disk_id: &str, number: u32) -> Result<&Partition, StorageError> {
        self.disk(disk_id)?
            .partition(number)
            .structured(NotFoundError::Partition {
                disk: disk_id.to_string(),
                number,
            })
    }

    pub fn volume_group(&self, name: &str) -> Result<&VolumeGroup, StorageError> {
        self.volume_groups
            .iter()
            .find(|vg| vg.name == name)
            .structured(NotFoundError::VolumeGroup {
                name: name.to_string(),
            })
    }

    pub fn guided_choice(&self) -> Option<&GuidedChoice> {
        self.guided_choice.as_ref()
    }

    pub fn set_guided_choice(&mut self, choice: GuidedChoice) {
        self.guided_choice = Some(choice);
    }

    /// Replace the model with a freshly probed snapshot. Any plan built on
    /// the previous snapshot is discarded.
    pub fn load_probe_data(&mut self, data: Value) -> Result<(), StorageError> {
        let payload: ProbePayload = serde_json::from_value(data.clone())
            .context("probe payload did not match the expected schema")
            .map_err(|e| ProbeFailureError::LoadSnapshot {
                message: format!("{e:#}"),
            })?;

        let mut disks = Vec::new();
        for probed in payload.blockdev {
            let name = probed
                .path
                .rsplit('/')
                .next()
                .unwrap_or(probed.path.as_str())
                .to_string();
            let ptable = probed.ptable.unwrap_or_default();
            let align = ptable.alignment().part_align;

            let mut disk = Disk {
                id: format!("disk-{name}"),
                path: probed.path,
                serial: probed.serial,
                model: probed.model,
                size: probed.size,
                ptable,
                raid_member_of: probed.raid_member_of,
                preserve: true,
                wipe: None,
                partitions: Vec::new(),
            };

            for p in probed.partitions {
                if p.offset % align != 0 || p.size % align != 0 {
                    warn!(
                        "partition {} on {} is not {align}-byte aligned (offset {}, size {})",
                        p.number, disk.id, p.offset, p.size
                    );
                }
                disk.insert_partition(Partition {
                    number: p.number,
                    offset: p.offset,
                    size: p.size,
                    kind: p.kind,
                    part_uuid: p.partuuid,
                    fs: p.fstype.map(|fstype| Filesystem {
                        fstype,
                        mount: None,
                        preserve: true,
                    }),
                    boot: p.boot,
                    resize: false,
                    preserve: true,
                    estimated_min_size: p.estimated_min_size,
                    wipe: None,
                });
            }
            disks.push(disk);
        }

        self.bootloader = payload.bootloader.unwrap_or_default();
        self.disks = disks;
        self.volume_groups.clear();
        self.guided_choice = None;
        self.probe_data = Some(data);
        self.orig_actions = self.render(true);

        debug!(
            "loaded probe snapshot: {} disks, bootloader {:?}",
            self.disks.len(),
            self.bootloader
        );
        Ok(())
    }

    /// Discard all mutations and rebuild from the original probe snapshot.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        let data = self
            .probe_data
            .clone()
            .structured(InvariantViolationError::Internal(
                "reset requested before any probe snapshot was loaded".to_string(),
            ))?;
        info!("resetting storage model to the probed state");
        self.load_probe_data(data)
    }

    /// The rendering of the pristine snapshot, before any mutation.
    pub fn orig_actions(&self) -> &[Action] {
        &self.orig_actions
    }

    pub fn has_snapshot(&self) -> bool {
        self.probe_data.is_some()
    }

    /// Wipe a disk's partition table. Volume groups losing all members go
    /// with it.
    pub fn reformat(&mut self, disk_id: &str, wipe: WipePolicy) -> Result<(), StorageError> {
        let disk = self.disk_mut(disk_id)?;
        let removed: Vec<u32> = disk.partitions.iter().map(|p| p.number).collect();
        disk.partitions.clear();
        disk.preserve = false;
        disk.wipe = Some(wipe);
        let disk_id = disk.id.clone();
        for number in removed {
            self.prune_volume_memberships(&disk_id, number);
        }
        Ok(())
    }

    /// Create a partition inside a gap. The gap must come from a fresh
    /// derivation; its usable span bounds the request.
    pub fn create_partition(
        &mut self,
        disk_id: &str,
        gap: &Gap,
        spec: PartitionSpec,
        wipe: Option<WipePolicy>,
    ) -> Result<Partition, StorageError> {
        let alignment = self.disk(disk_id)?.alignment();
        let offset = gap.first_usable_offset(&alignment);
        let size = sizes::align_up(spec.size.unwrap_or(gap.usable), alignment.part_align);
        if size > gap.usable {
            return Err(InvalidGeometryError::PartitionTooLarge {
                requested: size,
                available: gap.usable,
            }
            .into());
        }

        let disk = self.disk_mut(disk_id)?;
        let kind = if gap.in_extended {
            PartitionKind::Logical
        } else {
            PartitionKind::Primary
        };
        let number = disk.next_partition_number(kind)?;
        let partition = Partition {
            number,
            offset,
            size,
            kind,
            part_uuid: None,
            fs: spec.fstype.map(|fstype| Filesystem {
                fstype,
                mount: spec.mount,
                preserve: false,
            }),
            boot: spec.boot,
            resize: false,
            preserve: false,
            estimated_min_size: None,
            wipe,
        };
        disk.insert_partition(partition.clone());
        debug!(
            "created partition {number} on {disk_id}: offset {offset}, size {size}"
        );
        Ok(partition)
    }

    pub fn delete_partition(&mut self, disk_id: &str, number: u32) -> Result<(), StorageError> {
        let disk = self.disk_mut(disk_id)?;
        let at = disk
            .partitions
            .iter()
            .position(|p| p.number == number)
            .structured(NotFoundError::Partition {
                disk: disk_id.to_string(),
                number,
            })?;
        disk.partitions.remove(at);
        self.prune_volume_memberships(disk_id, number);
        Ok(())
    }

    /// Resize a partition. The requested size is rounded up to the
    /// alignment unit, then checked against the partition's occupied floor
    /// and the next layout boundary.
    pub fn resize_partition(
        &mut self,
        disk_id: &str,
        number: u32,
        new_size: u64,
    ) -> Result<u64, StorageError> {
        let disk = self.disk(disk_id)?;
        let alignment = disk.alignment();
        let partition = disk.partition(number).structured(NotFoundError::Partition {
            disk: disk_id.to_string(),
            number,
        })?;

        let aligned = sizes::align_up(new_size, alignment.part_align);
        let floor = sizes::align_up(
            partition
                .estimated_min_size
                .unwrap_or(0)
                .max(alignment.part_align),
            alignment.part_align,
        );
        if aligned < floor {
            return Err(InvalidGeometryError::BelowPartitionMinimum {
                requested: aligned,
                minimum: floor,
            }
            .into());
        }
        let boundary = disk.growth_boundary(number);
        if partition.offset + aligned > boundary {
            return Err(InvalidGeometryError::OverlapsBoundary {
                end: partition.offset + aligned,
                boundary,
            }
            .into());
        }

        let disk = self.disk_mut(disk_id)?;
        let partition = disk.partition_mut(number).structured(NotFoundError::Partition {
            disk: disk_id.to_string(),
            number,
        })?;
        if partition.size != aligned {
            if partition.preserve {
                partition.resize = true;
            }
            partition.size = aligned;
        }
        Ok(aligned)
    }

    /// Create a volume group. Only an explicitly requested name can
    /// conflict; default naming scans deterministically for a free suffix.
    pub fn create_volume_group(
        &mut self,
        spec: VolumeGroupSpec,
    ) -> Result<String, StorageError> {
        for device in &spec.devices {
            self.partition(&device.disk_id, device.number)?;
        }

        let name = match spec.name {
            Some(name) => {
                if self.volume_groups.iter().any(|vg| vg.name == name) {
                    return Err(NameConflictError::VolumeGroup { name }.into());
                }
                name
            }
            None => {
                let mut name = DEFAULT_VG_NAME.to_string();
                let mut i = 0;
                while self.volume_groups.iter().any(|vg| vg.name == name) {
                    i += 1;
                    name = format!("{DEFAULT_VG_NAME}-{i}");
                }
                name
            }
        };

        self.volume_groups.push(VolumeGroup {
            name: name.clone(),
            devices: spec.devices,
            logical_volumes: Vec::new(),
        });
        Ok(name)
    }

    /// Aggregate size of a volume group: member partitions minus the
    /// per-PV metadata overhead, floored to the allocation chunk.
    pub fn volume_group_size(&self, vg: &VolumeGroup) -> u64 {
        vg.devices
            .iter()
            .filter_map(|d| self.partition(&d.disk_id, d.number).ok())
            .map(|p| sizes::align_down(p.size.saturating_sub(LVM_OVERHEAD), LVM_CHUNK_SIZE))
            .sum()
    }

    pub fn create_logical_volume(
        &mut self,
        vg_name: &str,
        spec: LogicalVolumeSpec,
    ) -> Result<(), StorageError> {
        let vg = self.volume_group(vg_name)?;
        if vg.logical_volumes.iter().any(|lv| lv.name == spec.name) {
            return Err(NameConflictError::LogicalVolume {
                vg: vg_name.to_string(),
                name: spec.name,
            }
            .into());
        }
        let available = self.volume_group_size(vg)
            - vg.logical_volumes.iter().map(|lv| lv.size).sum::<u64>();
        if spec.size > available {
            return Err(InvalidGeometryError::PartitionTooLarge {
                requested: spec.size,
                available,
            }
            .into());
        }

        let lv = LogicalVolume {
            name: spec.name,
            size: spec.size,
            fs: spec.fstype.map(|fstype| Filesystem {
                fstype,
                mount: spec.mount,
                preserve: false,
            }),
        };
        let vg = self
            .volume_groups
            .iter_mut()
            .find(|vg| vg.name == vg_name)
            .structured(NotFoundError::VolumeGroup {
                name: vg_name.to_string(),
            })?;
        vg.logical_volumes.push(lv);
        Ok(())
    }

    /// Add the bootloader partition to a disk, at the head of the first
    /// gap that fits it. No-op when the disk already carries one.
    pub fn add_boot_disk(&mut self, disk_id: &str) -> Result<(), StorageError> {
        let disk = self.disk(disk_id)?;
        if boot::is_boot_device(disk) {
            debug!("{disk_id} already carries a boot partition");
            return Ok(());
        }
        let alignment = disk.alignment();
        let spec = self.bootloader.partition_spec();
        let wanted = self.bootloader.partition_size();
        // The bootloader partition must be primary, so extended-container
        // space does not qualify.
        let gap = gaps::gaps(disk)
            .into_iter()
            .find(|g| !g.in_extended && g.usable >= wanted)
            .structured(NotFoundError::NoGapLargeEnough)?;
        let (head, _) = gap.split(wanted, alignment.part_align)?;
        self.create_partition(disk_id, &head, spec, Some(WipePolicy::Superblock))?;
        Ok(())
    }

    /// A filesystem in the plan mounts at /.
    pub fn is_root_mounted(&self) -> bool {
        let mounts_root = |fs: &Option<Filesystem>| {
            fs.as_ref()
                .and_then(|f| f.mount.as_deref())
                .map(|m| m == "/")
                .unwrap_or(false)
        };
        self.disks
            .iter()
            .flat_map(|d| d.partitions())
            .any(|p| mounts_root(&p.fs))
            || self
                .volume_groups
                .iter()
                .flat_map(|vg| vg.logical_volumes())
                .any(|lv| mounts_root(&lv.fs))
    }

    /// No disk carries a bootloader partition yet.
    pub fn needs_boot_partition(&self) -> bool {
        !self.disks.iter().any(boot::is_boot_device)
    }

    fn prune_volume_memberships(&mut self, disk_id: &str, number: u32) {
        for vg in &mut self.volume_groups {
            vg.devices
                .retain(|d| !(d.disk_id == disk_id && d.number == number));
        }
        let before = self.volume_groups.len();
        self.volume_groups.retain(|vg| !vg.devices.is_empty());
        if self.volume_groups.len() != before {
            info!("dropped volume group(s) that lost their last member partition");
        }
    }

    /// Serialize the plan as an ordered action stream for the applier.
    /// With `include_all` unset, disks whose layout is untouched since the
    /// probe are omitted.
    pub fn render(&self, include_all: bool) -> Vec<Action> {
        let modified = |p: &Partition| {
            !p.preserve
                || p.resize
                || p.fs.as_ref().map(|f| !f.preserve).unwrap_or(false)
        };

        let mut actions = Vec::new();
        let mut formats: Vec<(String, Filesystem)> = Vec::new();

        for disk in &self.disks {
            let dirty = !disk.preserve || disk.partitions.iter().any(modified);
            if !include_all && !dirty {
                continue;
            }
            actions.push(Action::Disk {
                id: disk.id.clone(),
                path: disk.path.clone(),
                ptable: disk.ptable.to_string(),
                preserve: disk.preserve,
                wipe: disk.wipe.map(|w| w.to_string()),
            });
            let short = disk.id.strip_prefix("disk-").unwrap_or(&disk.id);
            for p in &disk.partitions {
                let part_id = format!("partition-{short}-{}", p.number);
                let flag = if p.boot {
                    Some("boot".to_string())
                } else {
                    match p.kind {
                        PartitionKind::Extended => Some("extended".to_string()),
                        PartitionKind::Logical => Some("logical".to_string()),
                        PartitionKind::Primary => None,
                    }
                };
                actions.push(Action::Partition {
                    id: part_id.clone(),
                    device: disk.id.clone(),
                    number: p.number,
                    offset: p.offset,
                    size: p.size.into(),
                    flag,
                    preserve: p.preserve,
                    resize: p.resize,
                    wipe: p.wipe.map(|w| w.to_string()),
                });
                if let Some(fs) = &p.fs {
                    formats.push((part_id, fs.clone()));
                }
            }
        }

        for vg in &self.volume_groups {
            let vg_id = format!("volgroup-{}", vg.name);
            actions.push(Action::LvmVolgroup {
                id: vg_id.clone(),
                name: vg.name.clone(),
                devices: vg
                    .devices
                    .iter()
                    .map(|d| {
                        let short = d.disk_id.strip_prefix("disk-").unwrap_or(&d.disk_id);
                        format!("partition-{short}-{}", d.number)
                    })
                    .collect(),
            });
            for lv in &vg.logical_volumes {
                let lv_id = format!("logvol-{}-{}", vg.name, lv.name);
                actions.push(Action::LvmLogvol {
                    id: lv_id.clone(),
                    name: lv.name.clone(),
                    volgroup: vg_id.clone(),
                    size: lv.size.into(),
                });
                if let Some(fs) = &lv.fs {
                    formats.push((lv_id, fs.clone()));
                }
            }
        }

        let mut mounts = Vec::new();
        for (volume, fs) in formats {
            let format_id = format!("format-{volume}");
            actions.push(Action::Format {
                id: format_id.clone(),
                volume,
                fstype: fs.fstype.clone(),
                preserve: fs.preserve,
            });
            if let Some(path) = fs.mount {
                mounts.push(Action::Mount {
                    id: format!("mount-{format_id}"),
                    device: format_id,
                    path,
                });
            }
        }
        actions.extend(mounts);

        actions
    }

    /// Apply a literal, already-resolved action list from an unattended
    /// document. References are resolved against the probed model; the
    /// stream replaces any plan built so far.
    pub fn apply_config_actions(&mut self, actions: &[Action]) -> Result<(), StorageError> {
        use std::collections::HashMap;

        // action id -> (disk, partition number) or volume group name
        let mut partitions: HashMap<String, PartitionRef> = HashMap::new();
        let mut disks: HashMap<String, String> = HashMap::new();
        let mut logvols: HashMap<String, (String, String)> = HashMap::new();
        let mut format_targets: HashMap<String, String> = HashMap::new();

        for action in actions {
            match action {
                Action::Disk {
                    id,
                    path,
                    preserve,
                    wipe,
                    ..
                } => {
                    let disk_id = self
                        .disks
                        .iter()
                        .find(|d| &d.id == id || &d.path == path)
                        .map(|d| d.id.clone())
                        .structured(NotFoundError::Disk { id: id.clone() })?;
                    if !preserve {
                        let policy = match wipe.as_deref() {
                            Some("superblock") => WipePolicy::Superblock,
                            _ => WipePolicy::SuperblockRecursive,
                        };
                        self.reformat(&disk_id, policy)?;
                    }
                    disks.insert(id.clone(), disk_id);
                }
                Action::Partition {
                    id,
                    device,
                    number,
                    offset,
                    size,
                    flag,
                    preserve,
                    resize,
                    wipe,
                } => {
                    let disk_id = disks
                        .get(device)
                        .cloned()
                        .structured(NotFoundError::Disk { id: device.clone() })?;
                    if *preserve {
                        let partition =
                            self.partition(&disk_id, *number).map(|p| p.clone())?;
                        if *resize && partition.size != size.bytes() {
                            self.resize_partition(&disk_id, *number, size.bytes())?;
                        }
                    } else {
                        let disk = self.disk(&disk_id)?;
                        let gap = gaps::at_offset(disk, *offset)?;
                        let spec = PartitionSpec {
                            size: Some(size.bytes()),
                            fstype: None,
                            mount: None,
                            boot: flag.as_deref() == Some("boot"),
                        };
                        let policy = wipe.as_deref().map(|w| match w {
                            "superblock-recursive" => WipePolicy::SuperblockRecursive,
                            _ => WipePolicy::Superblock,
                        });
                        self.create_partition(&disk_id, &gap, spec, policy)?;
                    }
                    // The created number may differ from the requested one
                    // only on a malformed stream; references use the id.
                    let actual = self
                        .disk(&disk_id)?
                        .partitions()
                        .iter()
                        .find(|p| p.offset == *offset)
                        .map(|p| p.number)
                        .unwrap_or(*number);
                    partitions.insert(
                        id.clone(),
                        PartitionRef {
                            disk_id,
                            number: actual,
                        },
                    );
                }
                Action::LvmVolgroup { id, name, devices } => {
                    let members = devices
                        .iter()
                        .map(|d| {
                            partitions.get(d).cloned().structured(
                                NotFoundError::Partition {
                                    disk: d.clone(),
                                    number: 0,
                                },
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let vg_name = self.create_volume_group(VolumeGroupSpec {
                        name: Some(name.clone()),
                        devices: members,
                    })?;
                    disks.insert(id.clone(), vg_name);
                }
                Action::LvmLogvol {
                    id,
                    name,
                    volgroup,
                    size,
                } => {
                    let vg_name = disks
                        .get(volgroup)
                        .cloned()
                        .structured(NotFoundError::VolumeGroup {
                            name: volgroup.clone(),
                        })?;
                    self.create_logical_volume(
                        &vg_name,
                        LogicalVolumeSpec {
                            name: name.clone(),
                            size: size.bytes(),
                            fstype: None,
                            mount: None,
                        },
                    )?;
                    logvols.insert(id.clone(), (vg_name, name.clone()));
                }
                Action::Format {
                    id,
                    volume,
                    fstype,
                    preserve,
                } => {
                    let fs = Filesystem {
                        fstype: fstype.clone(),
                        mount: None,
                        preserve: *preserve,
                    };
                    if let Some(part) = partitions.get(volume) {
                        let disk_id = part.disk_id.clone();
                        let number = part.number;
                        let disk = self.disk_mut(&disk_id)?;
                        let partition =
                            disk.partition_mut(number).structured(NotFoundError::Partition {
                                disk: disk_id.clone(),
                                number,
                            })?;
                        partition.fs = Some(fs);
                    } else if let Some((vg, lv)) = logvols.get(volume) {
                        let (vg, lv) = (vg.clone(), lv.clone());
                        self.set_logvol_fs(&vg, &lv, fs)?;
                    } else {
                        return Err(NotFoundError::Partition {
                            disk: volume.clone(),
                            number: 0,
                        }
                        .into());
                    }
                    format_targets.insert(id.clone(), volume.clone());
                }
                Action::Mount { device, path, .. } => {
                    let volume = format_targets
                        .get(device)
                        .cloned()
                        .structured(NotFoundError::Partition {
                            disk: device.clone(),
                            number: 0,
                        })?;
                    if let Some(part) = partitions.get(&volume).cloned() {
                        let disk = self.disk_mut(&part.disk_id)?;
                        if let Some(p) = disk.partition_mut(part.number) {
                            if let Some(fs) = &mut p.fs {
                                fs.mount = Some(path.clone());
                            }
                        }
                    } else if let Some((vg, lv)) = logvols.get(&volume).cloned() {
                        self.set_logvol_mount(&vg, &lv, path.clone())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_logvol_fs(
        &mut self,
        vg_name: &str,
        lv_name: &str,
        fs: Filesystem,
    ) -> Result<(), StorageError> {
        let vg = self
            .volume_groups
            .iter_mut()
            .find(|vg| vg.name == vg_name)
            .structured(NotFoundError::VolumeGroup {
                name: vg_name.to_string(),
            })?;
        let lv = vg
            .logical_volumes
            .iter_mut()
            .find(|lv| lv.name == lv_name)
            .structured(NotFoundError::VolumeGroup {
                name: format!("{vg_name}/{lv_name}"),
            })?;
        lv.fs = Some(fs);
        Ok(())
    }

    fn set_logvol_mount(
        &mut self,
        vg_name: &str,
        lv_name: &str,
        mount: String,
    ) -> Result<(), StorageError> {
        let vg = self
            .volume_groups
            .iter_mut()
            .find(|vg| vg.name == vg_name)
            .structured(NotFoundError::VolumeGroup {
                name: vg_name.to_string(),
            })?;
        if let Some(lv) = vg.logical_volumes.iter_mut().find(|lv| lv.name == lv_name) {
            if let Some(fs) = &mut lv.fs {
                fs.mount = Some(mount);
            }
        }
        Ok(())
    }
}
