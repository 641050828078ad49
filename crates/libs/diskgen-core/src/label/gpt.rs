//! Layout of GPT labels.
//!
//! The primary partition entries are canonically placed right after the primary
//! header. When a region with a fixed start occupies this location, e.g., a
//! bootloader which the SoC loads from a fixed offset, the entries are moved behind
//! that region. The header written by the partition table backend still points to
//! the canonical location, so the header and the entries are fixed up when the
//! image is written.

use tracing::warn;

use crate::disk::gpt::{Guid, GPT_HEADER_OFFSET, GPT_TABLE_SECTORS, GPT_TABLE_SIZE};
use crate::disk::{DiskId, EntryKind, PartitionTableDef, TableEntry};
use crate::region::{Region, RegionKind};
use crate::size::{SizeType, SECTOR_SIZE};
use crate::{bail, Result};

use super::partition_sectors;

/// Notice emitted when the primary partition entries are relocated.
pub const GPT_RELOCATION_NOTICE: &str =
    "The location for the GPT Partition Table is used by another region. Table will be relocated";

pub const PROTECTIVE_MBR_NAME: &str = "Protective MBR";
pub const GPT_HEADER_NAME: &str = "GPT Header";
pub const GPT_TABLE_NAME: &str = "GPT Partition Table";
pub const GPT_BACKUP_NAME: &str = "Secondary GPT Header and Table";

/// Regions of the protective MBR, the primary header, and the primary entries.
pub(super) fn header_regions() -> [Region; 3] {
    [
        Region::synthetic(
            PROTECTIVE_MBR_NAME,
            SizeType::ZERO,
            SizeType::new(SECTOR_SIZE),
            RegionKind::ProtectiveMbr,
        ),
        Region::synthetic(
            GPT_HEADER_NAME,
            SizeType::new(GPT_HEADER_OFFSET),
            SizeType::new(SECTOR_SIZE),
            RegionKind::GptHeader,
        ),
        Region::synthetic(
            GPT_TABLE_NAME,
            SizeType::new(GPT_HEADER_OFFSET + SECTOR_SIZE),
            SizeType::new(GPT_TABLE_SIZE),
            RegionKind::GptTable {
                relocated: false,
                backup_start: SizeType::UNDEFINED,
            },
        ),
    ]
}

fn table_index(parts: &[Region]) -> Result<usize> {
    match parts
        .iter()
        .position(|part| matches!(part.kind(), RegionKind::GptTable { .. }))
    {
        Some(idx) => Ok(idx),
        None => bail!("GPT label without partition table region"),
    }
}

/// Move the primary partition entries behind all fixed regions overlapping them.
///
/// Moving the entries may create an overlap with a region which has already been
/// checked, hence, the scan restarts after every move.
pub(super) fn relocate_table(parts: &mut [Region]) -> Result<()> {
    let table_idx = table_index(parts)?;
    let mut relocated = false;
    loop {
        let table_start = parts[table_idx].start().bytes()?;
        let table_end = parts[table_idx].end()?.bytes()?;
        let mut new_start = None;
        for (idx, part) in parts.iter().enumerate() {
            if idx == table_idx || part.start().is_undefined() {
                continue;
            }
            let start = part.start().bytes()?;
            let end = part.end()?;
            if start < table_end && table_start < end.bytes()? {
                new_start = Some(end.align_up(SECTOR_SIZE)?);
                break;
            }
        }
        let Some(new_start) = new_start else {
            break;
        };
        parts[table_idx].set_start(new_start);
        relocated = true;
    }
    if relocated {
        warn!("{GPT_RELOCATION_NOTICE}");
        if let RegionKind::GptTable {
            relocated: flag, ..
        } = parts[table_idx].kind_mut()
        {
            *flag = true;
        }
    }
    Ok(())
}

/// Append the backup entries and header behind the last region.
pub(super) fn append_backup(parts: &mut Vec<Region>) -> Result<()> {
    let mut last_end = SizeType::ZERO;
    for part in parts.iter() {
        let end = part.end()?;
        if end.bytes()? > last_end.bytes()? {
            last_end = end;
        }
    }
    let backup_start = last_end.align_up(SECTOR_SIZE)?;
    let table_idx = table_index(parts)?;
    if let RegionKind::GptTable {
        backup_start: start,
        ..
    } = parts[table_idx].kind_mut()
    {
        *start = backup_start;
    }
    parts.push(Region::synthetic(
        GPT_BACKUP_NAME,
        backup_start,
        SizeType::from_sectors(GPT_TABLE_SECTORS + 1),
        RegionKind::GptBackup,
    ));
    Ok(())
}

/// Build the GUID partition table from regions sorted by their start.
pub(super) fn partition_table(
    parts: &[Region],
    boot: Option<&str>,
    disk_guid: Guid,
    image_size: u64,
) -> Result<PartitionTableDef> {
    let mut entries = Vec::new();
    for part in parts {
        let Some(fstype) = part.fstype() else {
            continue;
        };
        let (start, size) = partition_sectors(part)?;
        let Ok(number) = u8::try_from(entries.len() + 1) else {
            bail!("Too many partitions for a GUID partition table");
        };
        entries.push(TableEntry {
            number,
            kind: EntryKind::Primary,
            start,
            size,
            ty: fstype.gpt_type(),
            bootable: boot == Some(part.name()),
            name: part.name().to_owned(),
            guid: Some(Guid::random()),
        });
    }
    let table = &parts[table_index(parts)?];
    let gpt_entries_end = match table.kind() {
        RegionKind::GptTable {
            relocated: true, ..
        } => Some(table.end()?.sectors()?),
        _ => None,
    };
    Ok(PartitionTableDef {
        disk_id: DiskId::Gpt(disk_guid),
        disk_sectors: image_size / SECTOR_SIZE,
        entries,
        gpt_entries_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::EmptyContent;

    fn table_start(parts: &[Region]) -> u64 {
        parts[table_index(parts).unwrap()].start().bytes().unwrap()
    }

    #[test]
    fn test_no_relocation() {
        let mut parts = Vec::from(header_regions());
        parts.push(Region::raw("floating", EmptyContent::with_size(SizeType::new(512))));
        relocate_table(&mut parts).unwrap();
        assert_eq!(table_start(&parts), 1024);
    }

    #[test]
    fn test_relocation_restarts_scan() {
        let mut parts = Vec::from(header_regions());
        // The first region only overlaps after the table has been moved.
        parts.push(
            Region::raw("b", EmptyContent::new())
                .with_start(SizeType::new(17_500))
                .with_size(SizeType::new(1000)),
        );
        parts.push(
            Region::raw("a", EmptyContent::new())
                .with_start(SizeType::new(1024))
                .with_size(SizeType::new(100)),
        );
        relocate_table(&mut parts).unwrap();
        assert_eq!(table_start(&parts), 18_944);
        assert!(matches!(
            parts[2].kind(),
            RegionKind::GptTable {
                relocated: true,
                ..
            }
        ));
    }

    #[test]
    fn test_backup_is_sector_aligned() {
        let mut parts = Vec::from(header_regions());
        parts.push(
            Region::raw("odd", EmptyContent::new())
                .with_start(SizeType::new(20_000))
                .with_size(SizeType::new(100)),
        );
        append_backup(&mut parts).unwrap();
        let backup = parts.last().unwrap();
        assert_eq!(backup.start(), SizeType::new(20_480));
        assert_eq!(backup.size(), SizeType::new(33 * 512));
    }
}
