//! Guided partitioning: realize a high-level target (reformat, use-gap,
//! resize) as concrete model mutations, and enumerate which targets the
//! probed hardware makes feasible.

use log::{debug, info};

use keel_api::{
    config::{GapRef, GuidedChoice, GuidedTarget, LayoutName},
    constants::DEFAULT_LV_NAME,
    error::{
        InvalidGeometryError, InvariantViolationError, NotFoundError, ReportError, StorageError,
    },
    status::GuidedScenario,
};

use crate::model::{
    boot, gaps,
    gaps::Gap,
    sizes, Disk, LogicalVolumeSpec, PartitionKind, PartitionRef, PartitionSpec, StorageModel,
    VolumeGroupSpec, WipePolicy,
};

/// Apply one guided target and return the gap the install payload goes
/// into. Each variant has exactly one handler.
pub fn apply_target(model: &mut StorageModel, target: &GuidedTarget) -> Result<Gap, StorageError> {
    match target {
        GuidedTarget::Reformat { disk_id } => {
            model.reformat(disk_id, WipePolicy::SuperblockRecursive)?;
            gaps::largest_gap(std::iter::once(model.disk(disk_id)?))
                .structured(NotFoundError::NoGapLargeEnough)
        }

        GuidedTarget::UseGap { disk_id, gap } => gaps::at_offset(model.disk(disk_id)?, gap.offset),

        GuidedTarget::Resize {
            disk_id,
            partition_number,
            new_size,
        } => {
            let partition = model.partition(disk_id, *partition_number)?;
            let align = model.disk(disk_id)?.alignment().part_align;
            let aligned = sizes::align_up(*new_size, align);
            if aligned > partition.size {
                return Err(InvalidGeometryError::EnlargesPartition {
                    requested: aligned,
                    current: partition.size,
                }
                .into());
            }
            let offset = partition.offset;
            model.resize_partition(disk_id, *partition_number, aligned)?;

            // Where the freed gap lands depends on alignment and on a
            // possible logical-partition spacer. If it is absent, the
            // resize math and the gap derivation disagree, which must
            // never happen.
            gaps::after(model.disk(disk_id)?, offset).structured(
                InvariantViolationError::MissingGapAfterResize {
                    disk: disk_id.clone(),
                    number: *partition_number,
                },
            )
        }
    }
}

/// Single root partition spanning the install gap.
fn guided_direct(model: &mut StorageModel, disk_id: &str, gap: &Gap) -> Result<(), StorageError> {
    let spec = PartitionSpec {
        size: None,
        fstype: Some("ext4".to_string()),
        mount: Some("/".to_string()),
        boot: false,
    };
    model.create_partition(disk_id, gap, spec, Some(WipePolicy::Superblock))?;
    Ok(())
}

/// /boot partition plus one volume group holding a policy-sized root
/// logical volume.
fn guided_lvm(model: &mut StorageModel, disk_id: &str, gap: &Gap) -> Result<(), StorageError> {
    let align = model.disk(disk_id)?.alignment().part_align;
    let (gap_boot, gap_rest) = gap.split(sizes::boot_fs_size(gap.size), align)?;
    let gap_rest = gap_rest.structured(NotFoundError::NoGapLargeEnough)?;

    model.create_partition(
        disk_id,
        &gap_boot,
        PartitionSpec {
            size: None,
            fstype: Some("ext4".to_string()),
            mount: Some("/boot".to_string()),
            boot: false,
        },
        Some(WipePolicy::Superblock),
    )?;
    let pv = model.create_partition(
        disk_id,
        &gap_rest,
        PartitionSpec::default(),
        Some(WipePolicy::Superblock),
    )?;

    let vg_name = model.create_volume_group(VolumeGroupSpec {
        name: None,
        devices: vec![PartitionRef {
            disk_id: disk_id.to_string(),
            number: pv.number,
        }],
    })?;
    let vg_size = model.volume_group_size(model.volume_group(&vg_name)?);
    let lv_size = sizes::lv_size_policy(vg_size);
    model.create_logical_volume(
        &vg_name,
        LogicalVolumeSpec {
            name: DEFAULT_LV_NAME.to_string(),
            size: lv_size,
            fstype: Some("ext4".to_string()),
            mount: Some("/".to_string()),
        },
    )?;
    debug!("guided lvm: {vg_name} sized {vg_size}, root lv sized {lv_size}");
    Ok(())
}

/// Resolve and apply a full guided choice: apply the target, add a boot
/// partition when the disk lacks one, re-derive the gap, then lay out the
/// requested flavor inside it.
#[tracing::instrument(name = "guided_partitioning", skip_all, fields(target = %choice.target))]
pub fn guided(model: &mut StorageModel, choice: &GuidedChoice) -> Result<(), StorageError> {
    let disk_id = choice.target.disk_id().to_string();
    model.disk(&disk_id)?;

    info!("applying guided choice: {}", choice.target);
    let gap = apply_target(model, &choice.target)?;

    if !boot::is_boot_device(model.disk(&disk_id)?) {
        model.add_boot_disk(&disk_id)?;
    }
    // Find what is left of the gap after adding boot.
    let gap = gap
        .within(model.disk(&disk_id)?)
        .structured(InvariantViolationError::MissingGapAfterBoot {
            disk: disk_id.clone(),
        })?;

    match choice.layout {
        LayoutName::Direct => guided_direct(model, &disk_id, &gap)?,
        LayoutName::Lvm => guided_lvm(model, &disk_id, &gap)?,
    }

    model.set_guided_choice(choice.clone());
    Ok(())
}

/// Disks a guided install may target. The boot-capability check differs
/// between the reformat passes (table about to be wiped) and the resize
/// pass (current occupancy binds), hence the two flags.
pub fn eligible_disks(
    model: &StorageModel,
    check_boot: bool,
    with_reformatting: bool,
) -> Vec<&Disk> {
    let mut disks = Vec::new();
    for disk in model.all_disks() {
        if check_boot
            && !boot::can_be_boot_device(disk, None, with_reformatting, model.bootloader)
        {
            continue;
        }
        if let Some(array) = &disk.raid_member_of {
            // A disk backing a bootable array serves the array's boot
            // path; it is not offered directly.
            let array_bootable = model
                .all_disks()
                .iter()
                .filter(|d| d.raid_member_of.as_ref() == Some(array))
                .any(|d| {
                    check_boot
                        && boot::can_be_boot_device(d, None, with_reformatting, model.bootloader)
                });
            if array_bootable {
                continue;
            }
        }
        disks.push(disk);
    }
    disks
}

/// Every guided target feasible on the probed hardware, paired with the
/// bytes it makes available, descending by that size. The sort is stable:
/// ties keep disk enumeration order, then Reformat before UseGap before
/// Resize.
pub fn enumerate_scenarios(model: &StorageModel, install_min: u64) -> Vec<GuidedScenario> {
    let mut scenarios = Vec::new();

    for disk in eligible_disks(model, true, true) {
        if disk.size >= install_min {
            scenarios.push(GuidedScenario {
                capacity: disk.size,
                target: GuidedTarget::Reformat {
                    disk_id: disk.id.clone(),
                },
            });
        }
    }

    for disk in eligible_disks(model, true, false) {
        if disk.partitions().is_empty() {
            // An empty disk is already covered by the reformat case.
            continue;
        }
        let Some(gap) = gaps::largest_gap(std::iter::once(disk)) else {
            continue;
        };
        if gap.usable >= install_min {
            scenarios.push(GuidedScenario {
                capacity: gap.usable,
                target: GuidedTarget::UseGap {
                    disk_id: disk.id.clone(),
                    gap: GapRef {
                        offset: gap.offset,
                        size: gap.size,
                    },
                },
            });
        }
    }

    for disk in eligible_disks(model, false, false) {
        let align = disk.alignment().part_align;
        for partition in disk.partitions() {
            if partition.kind == PartitionKind::Extended {
                continue;
            }
            let Some(plan) = sizes::calculate_resize(
                partition.estimated_min_size,
                partition.size,
                install_min,
                align,
            ) else {
                continue;
            };
            if !boot::can_be_boot_device(disk, Some(partition), false, model.bootloader) {
                continue;
            }
            scenarios.push(GuidedScenario {
                capacity: plan.install_max,
                target: GuidedTarget::Resize {
                    disk_id: disk.id.clone(),
                    partition_number: partition.number,
                    new_size: plan.recommended,
                },
            });
        }
    }

    scenarios.sort_by(|a, b| b.capacity.cmp(&a.capacity));
    scenarios
}
