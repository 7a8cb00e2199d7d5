//! Gap derivation: the free, usable regions of a disk, recomputed from the
//! current partition layout on every call. Gaps are never stored or cached
//! across a mutation.

use keel_api::error::{InvalidGeometryError, NotFoundError, StorageError};

use crate::model::{sizes, AlignmentData, Disk, PartitionKind};

/// A maximal free byte range on one disk. `size` is the nominal span;
/// `usable` subtracts alignment slack and, inside an extended partition,
/// the EBR spacer a new logical partition would need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub disk_id: String,
    pub offset: u64,
    pub size: u64,
    pub in_extended: bool,
    pub usable: u64,
}

impl Gap {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Too-small slivers stay in the listing (they tile the disk) but are
    /// not offered for allocation.
    pub fn is_usable(&self) -> bool {
        self.usable > 0
    }

    /// First offset a partition created in this gap may start at.
    pub fn first_usable_offset(&self, alignment: &AlignmentData) -> u64 {
        let ebr = if self.in_extended {
            alignment.ebr_space
        } else {
            0
        };
        sizes::align_up(self.offset, alignment.part_align) + ebr
    }

    /// Divide into `(head, tail)` where the head spans exactly `size` bytes
    /// (rounded up to the alignment unit) and the tail is the remainder, or
    /// `None` when the gap is fully consumed.
    pub fn split(&self, size: u64, alignment: u64) -> Result<(Gap, Option<Gap>), StorageError> {
        let head_size = sizes::align_up(size, alignment);
        if head_size > self.size {
            return Err(InvalidGeometryError::SplitTooLarge {
                size: head_size,
                available: self.size,
            }
            .into());
        }

        let head = Gap {
            disk_id: self.disk_id.clone(),
            offset: self.offset,
            size: head_size,
            in_extended: self.in_extended,
            usable: usable_span(self.offset, head_size, self.in_extended, alignment),
        };
        let tail = (head_size < self.size).then(|| Gap {
            disk_id: self.disk_id.clone(),
            offset: self.offset + head_size,
            size: self.size - head_size,
            in_extended: self.in_extended,
            usable: usable_span(
                self.offset + head_size,
                self.size - head_size,
                self.in_extended,
                alignment,
            ),
        });
        Ok((head, tail))
    }

    /// Re-derive this gap after an intervening mutation: the first current
    /// gap starting within the original range, if any survives.
    pub fn within(&self, disk: &Disk) -> Option<Gap> {
        gaps(disk)
            .into_iter()
            .find(|g| g.offset >= self.offset && g.offset < self.end())
    }
}

fn usable_span(offset: u64, size: u64, in_extended: bool, alignment: u64) -> u64 {
    let ebr = if in_extended {
        keel_api::constants::EBR_SPACE
    } else {
        0
    };
    let start = sizes::align_up(offset, alignment) + ebr;
    let end = sizes::align_down(offset + size, alignment);
    end.saturating_sub(start)
}

/// All gaps on a disk, ascending by offset. Together with the disk's
/// (non-extended) partitions the returned ranges tile `[0, disk.size)`
/// exactly once: the walk cursor starts at zero and every free span is
/// emitted, usable or not.
pub fn gaps(disk: &Disk) -> Vec<Gap> {
    let align = disk.alignment().part_align;
    let extended = disk
        .partitions()
        .iter()
        .find(|p| p.kind == PartitionKind::Extended)
        .map(|p| (p.offset, p.offset + p.size));

    let mut result = Vec::new();
    let mut cursor = 0u64;
    let mut spans: Vec<(u64, u64)> = disk
        .partitions()
        .iter()
        .filter(|p| p.kind != PartitionKind::Extended)
        .map(|p| (p.offset, p.offset + p.size))
        .collect();
    spans.sort_unstable();

    let emit = |start: u64, end: u64, result: &mut Vec<Gap>| {
        if end <= start {
            return;
        }
        let in_extended = extended
            .map(|(ext_start, ext_end)| start >= ext_start && end <= ext_end)
            .unwrap_or(false);
        result.push(Gap {
            disk_id: disk.id.clone(),
            offset: start,
            size: end - start,
            in_extended,
            usable: usable_span(start, end - start, in_extended, align),
        });
    };

    for (start, end) in spans {
        // A free span crossing an extended partition boundary is emitted in
        // two parts so the in_extended tag stays exact.
        if let Some((ext_start, ext_end)) = extended {
            for boundary in [ext_start, ext_end] {
                if cursor < boundary && boundary < start {
                    emit(cursor, boundary, &mut result);
                    cursor = boundary;
                }
            }
        }
        emit(cursor, start, &mut result);
        cursor = cursor.max(end);
    }
    if let Some((ext_start, ext_end)) = extended {
        for boundary in [ext_start, ext_end] {
            if cursor < boundary && boundary < disk.size {
                emit(cursor, boundary, &mut result);
                cursor = boundary;
            }
        }
    }
    emit(cursor, disk.size, &mut result);

    result
}

/// The gap with the largest usable size across a set of disks. Ties are
/// broken by disk enumeration order, then by offset — strictly-greater
/// comparison keeps the first.
pub fn largest_gap<'a>(disks: impl IntoIterator<Item = &'a Disk>) -> Option<Gap> {
    let mut best: Option<Gap> = None;
    for disk in disks {
        for gap in gaps(disk) {
            if !gap.is_usable() {
                continue;
            }
            if best.as_ref().map(|b| gap.usable > b.usable).unwrap_or(true) {
                best = Some(gap);
            }
        }
    }
    best
}

/// The gap whose range contains `offset`.
pub fn at_offset(disk: &Disk, offset: u64) -> Result<Gap, StorageError> {
    gaps(disk)
        .into_iter()
        .find(|g| g.offset <= offset && offset < g.end())
        .ok_or_else(|| {
            NotFoundError::Gap {
                disk: disk.id.clone(),
                offset,
            }
            .into()
        })
}

/// The first gap starting strictly after `offset`.
pub fn after(disk: &Disk, offset: u64) -> Option<Gap> {
    gaps(disk).into_iter().find(|g| g.offset > offset)
}
