//! Partition tables and the backends writing them.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{IoContext, Result};

pub mod gpt;
pub mod mbr;
pub mod sfdisk;
pub mod stream;

pub use self::sfdisk::SfdiskBackend;

/// Standard sector size in bytes.
pub const SECTOR_SIZE: u64 = crate::size::SECTOR_SIZE;

/// Type of a partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Gpt,
    Mbr,
}

impl std::fmt::Display for PartitionTableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionTableType::Gpt => f.write_str("gpt"),
            PartitionTableType::Mbr => f.write_str("mbr"),
        }
    }
}

/// Unique identifier of a disk.
///
/// The disk ID also includes the type of the partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskId {
    /// Unique identifier of an MBR disk.
    Mbr(mbr::MbrId),
    /// Unique identifier of a GPT disk.
    Gpt(gpt::Guid),
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskId::Mbr(id) => id.fmt(f),
            DiskId::Gpt(id) => id.fmt(f),
        }
    }
}

/// Partition type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    /// MBR partition type.
    Mbr(u8),
    /// GPT partition type.
    Gpt(gpt::Guid),
}

impl PartitionType {
    pub fn is_free(&self) -> bool {
        match self {
            PartitionType::Mbr(ty) => *ty == 0x00,
            PartitionType::Gpt(guid) => guid.is_zero(),
        }
    }

    pub fn is_extended(&self) -> bool {
        match self {
            PartitionType::Mbr(id) => matches!(id, 0x05 | 0x0F),
            PartitionType::Gpt(_) => false,
        }
    }
}

impl std::fmt::Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionType::Mbr(id) => f.write_fmt(format_args!("{:02x}", *id)),
            PartitionType::Gpt(id) => id.fmt(f),
        }
    }
}

impl std::fmt::Debug for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mbr(id) => f.write_fmt(format_args!("Mbr(0x{id:02x})")),
            Self::Gpt(id) => f.write_fmt(format_args!("Gpt({id})")),
        }
    }
}

/// Kind of a partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Primary partition.
    Primary,
    /// Extended partition containing the EBR chain.
    Extended,
    /// Logical partition inside the extended partition.
    Logical,
}

/// Entry of a partition table.
#[derive(Debug, Clone)]
pub struct TableEntry {
    /// Number of the partition, starting at 1. Logical partitions start at 5.
    pub number: u8,
    /// Kind of the entry.
    pub kind: EntryKind,
    /// Start sector.
    pub start: u64,
    /// Size in sectors.
    pub size: u64,
    /// Type of the partition.
    pub ty: PartitionType,
    /// Boot flag, or the legacy BIOS bootable attribute for GPT.
    pub bootable: bool,
    /// Name of the partition, only stored in GPT entries.
    pub name: String,
    /// Unique identifier of the partition, only for GPT entries.
    pub guid: Option<gpt::Guid>,
}

impl TableEntry {
    /// The sector after the partition.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Partition table to be written to an image.
#[derive(Debug, Clone)]
pub struct PartitionTableDef {
    /// Disk ID.
    pub disk_id: DiskId,
    /// Size of the disk in sectors.
    pub disk_sectors: u64,
    /// Entries sorted by their start.
    pub entries: Vec<TableEntry>,
    /// Sector after the primary GPT entries, if they have been moved.
    pub gpt_entries_end: Option<u64>,
}

impl PartitionTableDef {
    /// First sector usable by partitions of a GUID partition table.
    ///
    /// This is the sector after the primary entries unless a partition starts
    /// before it.
    pub fn first_usable_lba(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.start)
            .fold(
                self.gpt_entries_end.unwrap_or(gpt::GPT_FIRST_USABLE_LBA),
                u64::min,
            )
    }

    /// The type of the partition table.
    pub fn ty(&self) -> PartitionTableType {
        match self.disk_id {
            DiskId::Mbr(_) => PartitionTableType::Mbr,
            DiskId::Gpt(_) => PartitionTableType::Gpt,
        }
    }
}

/// Backend committing a partition table to an image file.
pub trait TableBackend {
    /// Name of the backend for diagnostics.
    fn name(&self) -> &str;

    /// Write the partition table to the image at `path`.
    ///
    /// The image must already have its final size.
    fn commit(&self, path: &Path, table: &PartitionTableDef) -> Result<()>;
}

/// Backend writing partition tables directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl TableBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn commit(&self, path: &Path, table: &PartitionTableDef) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(format!("unable to open image {}", path.display()))?;
        match table.ty() {
            PartitionTableType::Mbr => mbr::write_mbr(&mut file, table),
            PartitionTableType::Gpt => gpt::write_gpt(&mut file, table),
        }
        .context(format!("unable to write {} partition table", table.ty()))?;
        file.sync_all().context("unable to sync image")
    }
}
