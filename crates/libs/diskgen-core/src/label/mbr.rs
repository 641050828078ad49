//! Layout of MBR labels.

use std::collections::HashSet;

use crate::disk::mbr::{mbr_types, MbrId, MBR_DISK_ID_OFFSET};
use crate::disk::{DiskId, EntryKind, PartitionTableDef, TableEntry};
use crate::region::{Region, RegionKind};
use crate::size::{SizeType, SECTOR_SIZE};
use crate::{bail, Error, Result};

use super::partition_sectors;

/// Name of the region covering the disk id and partition entries.
pub const MBR_HEADER_NAME: &str = "MBR Header";

/// Maximum number of partitions without an extended partition.
const MAX_PRIMARY: usize = 4;

/// Number of primary partitions next to the extended partition.
const PRIMARY_WITH_EXTENDED: usize = 3;

/// Size of an extended boot record.
const EBR_SIZE: SizeType = SizeType::new(SECTOR_SIZE);

/// The region from the disk id to the end of the first sector.
pub(super) fn header_region() -> Region {
    let start = MBR_DISK_ID_OFFSET as u64;
    Region::synthetic(
        MBR_HEADER_NAME,
        SizeType::new(start),
        SizeType::new(SECTOR_SIZE - start),
        RegionKind::MbrHeader { disk_id: None },
    )
}

/// Reserve a sector for the EBR in front of every logical partition.
///
/// Does nothing unless there are more than four partitions. Otherwise, all but the
/// first three partitions by start become logical partitions. Floating partitions
/// follow the fixed ones in the order they were added.
pub(super) fn insert_ebr_headers(parts: &mut Vec<Region>) -> Result<()> {
    let partitions = parts.iter().filter(|part| part.is_partition()).count();
    if partitions <= MAX_PRIMARY {
        return Ok(());
    }
    parts.sort_by_key(|part| part.start().sort_key());
    let mut idx = 0;
    let mut nth = 0;
    while idx < parts.len() {
        if parts[idx].is_partition() {
            if nth >= PRIMARY_WITH_EXTENDED {
                let part = &parts[idx];
                let start = if part.start().is_defined() {
                    (part.start() - EBR_SIZE).map_err(|_| {
                        Error::config(format!(
                            "Logical partition '{}' leaves no room for its EBR",
                            part.name()
                        ))
                    })?
                } else {
                    SizeType::UNDEFINED
                };
                let ebr = Region::synthetic(
                    &format!("EBR Header ({})", part.name()),
                    start,
                    EBR_SIZE,
                    RegionKind::EbrHeader,
                );
                parts.insert(idx, ebr);
                idx += 1;
            }
            nth += 1;
        }
        idx += 1;
    }
    Ok(())
}

/// Check that every logical partition of placed regions directly follows its EBR.
pub(super) fn check_ebr_headers(parts: &[Region]) -> Result<()> {
    let ebr_ends = parts
        .iter()
        .filter(|part| matches!(part.kind(), RegionKind::EbrHeader))
        .map(|part| part.end().and_then(|end| Ok(end.bytes()?)))
        .collect::<Result<HashSet<_>>>()?;
    let partitions = parts.iter().filter(|part| part.is_partition());
    if partitions.clone().count() <= MAX_PRIMARY {
        return Ok(());
    }
    for part in partitions.skip(PRIMARY_WITH_EXTENDED) {
        if !ebr_ends.contains(&part.start().bytes()?) {
            bail!("Logical partition '{}' is not preceded by its EBR", part.name());
        }
    }
    Ok(())
}

/// Build the MBR partition table from regions sorted by their start.
///
/// The regions must have passed [`check_ebr_headers`].
pub(super) fn partition_table(
    parts: &[Region],
    boot: Option<&str>,
    disk_id: MbrId,
    image_size: u64,
) -> Result<PartitionTableDef> {
    let disk_sectors = image_size / SECTOR_SIZE;
    let partitions = parts
        .iter()
        .filter_map(|part| part.fstype().map(|fstype| (part, fstype)))
        .collect::<Vec<_>>();
    let with_extended = partitions.len() > MAX_PRIMARY;
    let mut entries = Vec::new();
    for (idx, (part, fstype)) in partitions.iter().enumerate() {
        let (start, size) = partition_sectors(part)?;
        let logical = with_extended && idx >= PRIMARY_WITH_EXTENDED;
        if logical && idx == PRIMARY_WITH_EXTENDED {
            let extended_start = start - 1;
            entries.push(TableEntry {
                number: 4,
                kind: EntryKind::Extended,
                start: extended_start,
                size: disk_sectors - extended_start,
                ty: mbr_types::EXTENDED_LBA,
                bootable: false,
                name: "Extended".to_owned(),
                guid: None,
            });
        }
        // Logical partitions are numbered from 5 onwards.
        let number = if logical { idx + 2 } else { idx + 1 };
        let Ok(number) = u8::try_from(number) else {
            bail!("Too many partitions for an MBR partition table");
        };
        entries.push(TableEntry {
            number,
            kind: if logical {
                EntryKind::Logical
            } else {
                EntryKind::Primary
            },
            start,
            size,
            ty: fstype.mbr_type(),
            bootable: boot == Some(part.name()),
            name: part.name().to_owned(),
            guid: None,
        });
    }
    Ok(PartitionTableDef {
        disk_id: DiskId::Mbr(disk_id),
        disk_sectors,
        entries,
        gpt_entries_end: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::EmptyContent;
    use crate::region::FsType;

    fn partition(name: &str, start: u64) -> Region {
        Region::partition(name, FsType::Ext4, EmptyContent::new())
            .with_start(SizeType::new(start))
            .with_size(SizeType::new(1024))
    }

    #[test]
    fn test_ebr_headers_follow_start_order() {
        let mut parts = vec![
            partition("p0", 8192),
            partition("p1", 4096),
            partition("p2", 16384),
            partition("p3", 2048),
            partition("p4", 12288),
        ];
        insert_ebr_headers(&mut parts).unwrap();
        let names = parts.iter().map(|part| part.name()).collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "p3",
                "p1",
                "p0",
                "EBR Header (p4)",
                "p4",
                "EBR Header (p2)",
                "p2"
            ]
        );
        assert_eq!(parts[3].start(), SizeType::new(12288 - 512));
        check_ebr_headers(&parts).unwrap();
    }

    #[test]
    fn test_missing_ebr_header() {
        let parts = (0..5)
            .map(|idx| partition(&format!("p{idx}"), 2048 * (idx + 1)))
            .collect::<Vec<_>>();
        let error = check_ebr_headers(&parts).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Logical partition 'p3' is not preceded by its EBR"
        );
    }

    #[test]
    fn test_no_ebr_headers_for_four_partitions() {
        let mut parts = (0..4)
            .map(|idx| partition(&format!("p{idx}"), 2048 * (idx + 1)))
            .collect::<Vec<_>>();
        insert_ebr_headers(&mut parts).unwrap();
        assert_eq!(parts.len(), 4);
        check_ebr_headers(&parts).unwrap();
    }
}
