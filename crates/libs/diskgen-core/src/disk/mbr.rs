//! Utilities for working with MBR partition tables.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use super::{EntryKind, PartitionTableDef, SECTOR_SIZE};

/// Offset of the disk id in the MBR.
pub const MBR_DISK_ID_OFFSET: usize = 0x1B8;
/// Offset of the partition entries in a boot record.
pub const MBR_ENTRIES_OFFSET: usize = 0x1BE;
/// Size of a partition entry.
pub const MBR_ENTRY_SIZE: usize = 16;

/// Partition type of entries linking EBRs.
const EBR_LINK_TYPE: u8 = 0x05;

/// Heads per cylinder for CHS addresses.
const CHS_HEADS: u64 = 255;
/// Sectors per track for CHS addresses.
const CHS_SECTORS: u64 = 63;

/// MBR disk id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MbrId {
    id: u32,
}

impl MbrId {
    /// Create an MBR disk id.
    pub const fn new(id: u32) -> Self {
        Self { id }
    }

    /// Generate a random, non-zero disk id.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u32>();
            if id != 0 {
                break Self::new(id);
            }
        }
    }

    pub const fn into_raw(self) -> u32 {
        self.id
    }
}

impl std::fmt::Display for MbrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("0x{:08x}", self.id))
    }
}

impl std::fmt::Debug for MbrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("MbrId(0x{:08x})", self.id))
    }
}

/// MBR partition types.
pub mod mbr_types {
    use crate::disk::PartitionType;

    /// Empty entry.
    pub const EMPTY: PartitionType = PartitionType::Mbr(0x00);

    /// Extended partition with CHS addressing.
    pub const EXTENDED_CHS: PartitionType = PartitionType::Mbr(0x05);
    /// Extended partition with LBA addressing.
    pub const EXTENDED_LBA: PartitionType = PartitionType::Mbr(0x0F);

    /// FAT16 partition with LBA addressing.
    pub const FAT16_LBA: PartitionType = PartitionType::Mbr(0x0E);
    /// FAT32 partition with LBA addressing.
    pub const FAT32_LBA: PartitionType = PartitionType::Mbr(0x0C);

    /// Linux swap.
    pub const LINUX_SWAP: PartitionType = PartitionType::Mbr(0x82);
    /// Linux filesystem.
    pub const LINUX: PartitionType = PartitionType::Mbr(0x83);

    /// EFI system partition.
    pub const EFI: PartitionType = PartitionType::Mbr(0xEF);
    /// Protective entry of a GUID partition table.
    pub const GPT_PROTECTIVE: PartitionType = PartitionType::Mbr(0xEE);
}

/// Encode an LBA as CHS address, saturating at the largest expressible one.
fn chs(lba: u64) -> [u8; 3] {
    let cylinder = lba / (CHS_HEADS * CHS_SECTORS);
    if cylinder > 1023 {
        return [0xFE, 0xFF, 0xFF];
    }
    let head = (lba / CHS_SECTORS) % CHS_HEADS;
    let sector = lba % CHS_SECTORS + 1;
    [
        head as u8,
        (sector as u8 & 0x3F) | ((cylinder >> 2) as u8 & 0xC0),
        cylinder as u8,
    ]
}

/// Encode a partition entry of a boot record.
///
/// For the protective entry of a GUID partition table, the CHS addresses are the
/// ones mandated by the UEFI standard.
pub(crate) fn encode_mbr_entry(bootable: bool, ty: u8, start: u32, size: u32) -> [u8; 16] {
    let mut entry = [0; MBR_ENTRY_SIZE];
    entry[0] = if bootable { 0x80 } else { 0x00 };
    let end = u64::from(start) + u64::from(size).max(1) - 1;
    if ty == 0xEE {
        entry[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
        entry[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    } else {
        entry[1..4].copy_from_slice(&chs(start.into()));
        entry[5..8].copy_from_slice(&chs(end));
    }
    entry[4] = ty;
    entry[8..12].copy_from_slice(&start.to_le_bytes());
    entry[12..16].copy_from_slice(&size.to_le_bytes());
    entry
}

/// Add the `0x55AA` signature to a boot record.
pub(crate) fn write_boot_signature(record: &mut [u8]) {
    record[510] = 0x55;
    record[511] = 0xAA;
}

fn to_u32(value: u64) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "partition exceeds the limits of an MBR partition table",
        )
    })
}

/// Write an MBR partition table, chaining logical partitions with EBRs.
///
/// Only the disk id, the partition entries, and the signatures are written, so
/// boot code in the first 440 bytes is left untouched. The EBR of a logical
/// partition is placed in the sector right before it.
pub(crate) fn write_mbr(file: &mut File, table: &PartitionTableDef) -> io::Result<()> {
    let super::DiskId::Mbr(disk_id) = table.disk_id else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "GPT disk id for MBR partition table",
        ));
    };
    let mut primary = Vec::new();
    let mut logical = Vec::new();
    let mut extended_start = None;
    for entry in &table.entries {
        let super::PartitionType::Mbr(ty) = entry.ty else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "GPT partition type in MBR partition table",
            ));
        };
        match entry.kind {
            EntryKind::Primary => primary.push(encode_mbr_entry(
                entry.bootable,
                ty,
                to_u32(entry.start)?,
                to_u32(entry.size)?,
            )),
            EntryKind::Extended => {
                extended_start = Some(entry.start);
                primary.push(encode_mbr_entry(
                    false,
                    ty,
                    to_u32(entry.start)?,
                    to_u32(entry.size)?,
                ));
            }
            EntryKind::Logical => logical.push((entry, ty)),
        }
    }
    if primary.len() > 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "more than 4 primary partitions",
        ));
    }

    let mut record = [0; SECTOR_SIZE as usize];
    record[MBR_DISK_ID_OFFSET..][..4].copy_from_slice(&disk_id.into_raw().to_le_bytes());
    for (idx, entry) in primary.iter().enumerate() {
        record[MBR_ENTRIES_OFFSET + idx * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE]
            .copy_from_slice(entry);
    }
    write_boot_signature(&mut record);
    file.seek(SeekFrom::Start(MBR_DISK_ID_OFFSET as u64))?;
    file.write_all(&record[MBR_DISK_ID_OFFSET..])?;

    if logical.is_empty() {
        return Ok(());
    }
    let Some(extended_start) = extended_start else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "logical partitions without extended partition",
        ));
    };
    for (idx, (entry, ty)) in logical.iter().enumerate() {
        let ebr = entry.start - 1;
        let mut record = [0; SECTOR_SIZE as usize];
        // The partition is addressed relative to its EBR.
        record[MBR_ENTRIES_OFFSET..][..MBR_ENTRY_SIZE].copy_from_slice(&encode_mbr_entry(
            entry.bootable,
            *ty,
            to_u32(entry.start - ebr)?,
            to_u32(entry.size)?,
        ));
        if let Some((next, _)) = logical.get(idx + 1) {
            // The next EBR is addressed relative to the extended partition.
            let next_ebr = next.start - 1;
            record[MBR_ENTRIES_OFFSET + MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE].copy_from_slice(
                &encode_mbr_entry(
                    false,
                    EBR_LINK_TYPE,
                    to_u32(next_ebr - extended_start)?,
                    to_u32(next.start + next.size - next_ebr)?,
                ),
            );
        }
        write_boot_signature(&mut record);
        file.seek(SeekFrom::Start(ebr * SECTOR_SIZE + MBR_ENTRIES_OFFSET as u64))?;
        file.write_all(&record[MBR_ENTRIES_OFFSET..])?;
    }
    Ok(())
}
