//! Utilities for working with GUID partition tables.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use thiserror::Error;

use super::mbr::{encode_mbr_entry, write_boot_signature, MBR_ENTRIES_OFFSET};
use super::{PartitionTableDef, SECTOR_SIZE};

/// Offset of the primary GPT header.
pub const GPT_HEADER_OFFSET: u64 = SECTOR_SIZE;
/// Offset of the field holding the header's size.
pub const GPT_HEADER_SIZE_FIELD: u64 = 12;
/// Offset of the field holding the header's CRC32 checksum.
pub const GPT_HEADER_CRC_FIELD: u64 = 16;
/// Offset of the field holding the starting LBA of the partition entries.
pub const GPT_ENTRIES_LBA_FIELD: u64 = 72;
/// Size of the GPT header structure.
pub const GPT_HEADER_SIZE: u32 = 92;
/// Number of partition entries.
pub const GPT_ENTRY_COUNT: u32 = 128;
/// Size of a partition entry.
pub const GPT_ENTRY_SIZE: u32 = 128;
/// Size of the partition entries array.
pub const GPT_TABLE_SIZE: u64 = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64;
/// Number of sectors used by the partition entries array.
pub const GPT_TABLE_SECTORS: u64 = GPT_TABLE_SIZE / SECTOR_SIZE;
/// Default first usable LBA, after the protective MBR, header and entries.
pub const GPT_FIRST_USABLE_LBA: u64 = 2 + GPT_TABLE_SECTORS;
/// Legacy BIOS bootable attribute bit.
pub const GPT_ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// Length of the GUID string encoding.
pub const GUID_STRING_LENGTH: usize = 36;

/// GUID as defined in Appendix A of the UEFI standard.
///
/// The bytes are stored in their on-disk, mixed-endian order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    bytes: [u8; 16],
}

impl Guid {
    /// Zero GUID marking unused partition entries.
    pub const ZERO: Guid = Guid::from_bytes([0; 16]);

    /// Create a GUID from the given on-disk bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    /// Generate a random GUID.
    pub fn random() -> Self {
        Self::from_uuid(uuid::Uuid::new_v4())
    }

    /// Create a GUID from the standard string encoding.
    pub fn from_hex_str(hex_str: &str) -> Result<Self, InvalidGuid> {
        if hex_str.len() != GUID_STRING_LENGTH {
            return Err(InvalidGuid::InvalidLength {
                length: hex_str.len(),
            });
        }
        uuid::Uuid::try_parse(hex_str)
            .map(Self::from_uuid)
            .map_err(|_| InvalidGuid::InvalidFormat)
    }

    fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self::from_bytes(uuid.to_bytes_le())
    }

    /// The on-disk bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Indicates whether all bytes are zero.
    pub fn is_zero(&self) -> bool {
        self.bytes == [0; 16]
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uuid = uuid::Uuid::from_bytes_le(self.bytes);
        f.write_str(uuid.hyphenated().encode_upper(&mut uuid::Uuid::encode_buffer()))
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Guid({self})"))
    }
}

impl std::str::FromStr for Guid {
    type Err = InvalidGuid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Guid::from_hex_str(s)
    }
}

impl<'de> serde::Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Guid::from_hex_str(&string).map_err(|_| {
            <D::Error as serde::de::Error>::invalid_value(
                serde::de::Unexpected::Str(&string),
                &"a GUID",
            )
        })
    }
}

/// Error indicating an invalid GUID string representation.
#[derive(Debug, Clone, Error)]
pub enum InvalidGuid {
    /// Invalid length.
    #[error("invalid length {length} of GUID, should be 36")]
    InvalidLength { length: usize },
    /// Invalid format.
    #[error("invalid GUID format")]
    InvalidFormat,
}

/// GPT partition types.
pub mod gpt_types {
    use super::Guid;
    use crate::disk::PartitionType;

    /// Partition type from the fields of the GUID's string encoding.
    const fn guid(d1: u32, d2: u16, d3: u16, d4: u64) -> PartitionType {
        let d1 = d1.to_le_bytes();
        let d2 = d2.to_le_bytes();
        let d3 = d3.to_le_bytes();
        let d4 = d4.to_be_bytes();
        PartitionType::Gpt(Guid::from_bytes([
            d1[0], d1[1], d1[2], d1[3], d2[0], d2[1], d3[0], d3[1], d4[0], d4[1], d4[2], d4[3],
            d4[4], d4[5], d4[6], d4[7],
        ]))
    }

    /// EFI system partition.
    pub const EFI: PartitionType = guid(0xC12A7328, 0xF81F, 0x11D2, 0xBA4B_00A0C93EC93B);
    /// Linux filesystem data.
    pub const LINUX: PartitionType = guid(0x0FC63DAF, 0x8483, 0x4772, 0x8E79_3D69D8477DE4);
    /// Linux swap.
    pub const LINUX_SWAP: PartitionType = guid(0x0657FD6D, 0xA4AB, 0x43C4, 0x84E5_0933C84B4F4F);
    /// Microsoft basic data, used for FAT filesystems.
    pub const BASIC_DATA: PartitionType = guid(0xEBD0A0A2, 0xB9E5, 0x4433, 0x87C0_68B6B72699C7);
}

/// Layout of a GUID partition table on a disk of a given size.
#[derive(Debug, Clone, Copy)]
struct GptGeometry {
    /// Number of sectors of the disk.
    disk_sectors: u64,
    first_usable: u64,
    last_usable: u64,
}

impl GptGeometry {
    fn backup_entries_lba(&self) -> u64 {
        self.disk_sectors - 1 - GPT_TABLE_SECTORS
    }

    fn backup_header_lba(&self) -> u64 {
        self.disk_sectors - 1
    }
}

/// Write a GUID partition table including its protective MBR and backup.
///
/// The primary entries are written to their canonical location at LBA 2.
pub(crate) fn write_gpt(file: &mut File, table: &PartitionTableDef) -> io::Result<()> {
    let disk_sectors = table.disk_sectors;
    if disk_sectors < 2 * (GPT_TABLE_SECTORS + 1) + 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "disk is too small for a GUID partition table",
        ));
    }
    let geometry = GptGeometry {
        disk_sectors,
        first_usable: table.first_usable_lba(),
        last_usable: disk_sectors - 2 - GPT_TABLE_SECTORS,
    };
    if table.entries.len() > GPT_ENTRY_COUNT as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many partitions for a GUID partition table",
        ));
    }

    let mut entries = vec![0; GPT_TABLE_SIZE as usize];
    for (idx, entry) in table.entries.iter().enumerate() {
        let super::PartitionType::Gpt(ty) = entry.ty else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "MBR partition type in GUID partition table",
            ));
        };
        let bytes = &mut entries[idx * GPT_ENTRY_SIZE as usize..][..GPT_ENTRY_SIZE as usize];
        bytes[0..16].copy_from_slice(ty.as_bytes());
        bytes[16..32].copy_from_slice(entry.guid.unwrap_or_else(Guid::random).as_bytes());
        bytes[32..40].copy_from_slice(&entry.start.to_le_bytes());
        bytes[40..48].copy_from_slice(&(entry.start + entry.size - 1).to_le_bytes());
        let attributes = if entry.bootable {
            GPT_ATTR_LEGACY_BIOS_BOOTABLE
        } else {
            0
        };
        bytes[48..56].copy_from_slice(&attributes.to_le_bytes());
        for (unit_idx, unit) in entry.name.encode_utf16().take(36).enumerate() {
            bytes[56 + 2 * unit_idx..][..2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    let entries_crc = crc32fast::hash(&entries);
    let super::DiskId::Gpt(disk_guid) = table.disk_id else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "MBR disk id for GUID partition table",
        ));
    };

    let mut pmbr = [0; SECTOR_SIZE as usize];
    let pmbr_size = u32::try_from(disk_sectors - 1).unwrap_or(u32::MAX);
    pmbr[MBR_ENTRIES_OFFSET..][..16].copy_from_slice(&encode_mbr_entry(
        false, 0xEE, 1, pmbr_size,
    ));
    write_boot_signature(&mut pmbr);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&pmbr)?;

    let primary = encode_header(
        &geometry,
        disk_guid,
        1,
        geometry.backup_header_lba(),
        2,
        entries_crc,
    );
    let backup = encode_header(
        &geometry,
        disk_guid,
        geometry.backup_header_lba(),
        1,
        geometry.backup_entries_lba(),
        entries_crc,
    );
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET))?;
    file.write_all(&primary)?;
    file.write_all(&entries)?;
    file.seek(SeekFrom::Start(geometry.backup_entries_lba() * SECTOR_SIZE))?;
    file.write_all(&entries)?;
    file.write_all(&backup)?;
    Ok(())
}

/// Encode a GPT header sector.
fn encode_header(
    geometry: &GptGeometry,
    disk_guid: Guid,
    my_lba: u64,
    alternate_lba: u64,
    entries_lba: u64,
    entries_crc: u32,
) -> [u8; SECTOR_SIZE as usize] {
    let mut header = [0; SECTOR_SIZE as usize];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    header[24..32].copy_from_slice(&my_lba.to_le_bytes());
    header[32..40].copy_from_slice(&alternate_lba.to_le_bytes());
    header[40..48].copy_from_slice(&geometry.first_usable.to_le_bytes());
    header[48..56].copy_from_slice(&geometry.last_usable.to_le_bytes());
    header[56..72].copy_from_slice(disk_guid.as_bytes());
    header[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    header[80..84].copy_from_slice(&GPT_ENTRY_COUNT.to_le_bytes());
    header[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    header[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32fast::hash(&header[..GPT_HEADER_SIZE as usize]);
    header[16..20].copy_from_slice(&crc.to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_roundtrip() {
        const EFI: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
        assert_eq!(Guid::from_hex_str(EFI).unwrap().to_string(), EFI);
        const LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
        assert_eq!(Guid::from_hex_str(LINUX).unwrap().to_string(), LINUX);
    }

    #[test]
    fn test_guid_mixed_endian() {
        let guid = Guid::from_hex_str("C12A7328-F81F-11D2-BA4B-00A0C93EC93B").unwrap();
        assert_eq!(
            guid.as_bytes(),
            &[
                0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9,
                0x3E, 0xC9, 0x3B
            ]
        );
        assert_eq!(gpt_types::EFI, crate::disk::PartitionType::Gpt(guid));
    }
}
