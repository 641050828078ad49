//! Regions of an image.
//!
//! A region is a contiguous byte range of the image with a name, a start, a size,
//! and a kind. Partitions are regions which get an entry in the partition table.
//! Other regions, e.g., a bootloader blob at a fixed offset, only occupy space.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use serde::Deserialize;

use crate::content::Content;
use crate::context::BuildContext;
use crate::disk::gpt::{
    gpt_types, GPT_ENTRIES_LBA_FIELD, GPT_HEADER_CRC_FIELD, GPT_HEADER_OFFSET,
    GPT_HEADER_SIZE_FIELD, GPT_TABLE_SIZE,
};
use crate::disk::mbr::{mbr_types, MbrId, MBR_DISK_ID_OFFSET};
use crate::disk::PartitionType;
use crate::size::{SizeType, SECTOR_SIZE};
use crate::{bail, IoContext, Result};

/// Filesystem type of a partition, determining its partition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Fat16,
    Fat32,
    Vfat,
    Esp,
    LinuxSwap,
}

impl FsType {
    /// Partition type in an MBR partition table.
    pub fn mbr_type(self) -> PartitionType {
        match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => mbr_types::LINUX,
            FsType::Fat16 => mbr_types::FAT16_LBA,
            FsType::Fat32 | FsType::Vfat => mbr_types::FAT32_LBA,
            FsType::Esp => mbr_types::EFI,
            FsType::LinuxSwap => mbr_types::LINUX_SWAP,
        }
    }

    /// Partition type in a GUID partition table.
    pub fn gpt_type(self) -> PartitionType {
        match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => gpt_types::LINUX,
            FsType::Fat16 | FsType::Fat32 | FsType::Vfat => gpt_types::BASIC_DATA,
            FsType::Esp => gpt_types::EFI,
            FsType::LinuxSwap => gpt_types::LINUX_SWAP,
        }
    }
}

impl std::str::FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "fat16" => FsType::Fat16,
            "fat32" => FsType::Fat32,
            "vfat" => FsType::Vfat,
            "esp" => FsType::Esp,
            "linux-swap" => FsType::LinuxSwap,
            _ => return Err(format!("unknown filesystem type {s:?}")),
        })
    }
}

/// Kind of a region.
#[derive(Debug)]
pub enum RegionKind {
    /// Space reserved without content.
    Empty,
    /// Content outside of any partition.
    Raw(Content),
    /// Partition with an entry in the partition table.
    Partition { fstype: FsType, content: Content },
    /// Disk id, partition entries, and signature of the MBR.
    MbrHeader { disk_id: Option<MbrId> },
    /// Extended boot record preceding a logical partition.
    EbrHeader,
    /// Protective MBR of a GUID partition table.
    ProtectiveMbr,
    /// Primary GPT header.
    GptHeader,
    /// Primary GPT partition entries.
    GptTable {
        /// The entries have been moved away from their canonical location.
        relocated: bool,
        /// Start of the backup entries, which have the same content.
        backup_start: SizeType,
    },
    /// Backup GPT partition entries and header.
    GptBackup,
}

/// Region of an image.
#[derive(Debug)]
pub struct Region {
    name: String,
    start: SizeType,
    size: SizeType,
    kind: RegionKind,
}

impl Region {
    fn new(name: impl Into<String>, kind: RegionKind) -> Self {
        Self {
            name: name.into(),
            start: SizeType::UNDEFINED,
            size: SizeType::UNDEFINED,
            kind,
        }
    }

    /// Region reserving space without writing anything.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, RegionKind::Empty)
    }

    /// Region with content but without partition table entry.
    pub fn raw(name: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(name, RegionKind::Raw(content.into()))
    }

    /// Partition with the given content.
    pub fn partition(name: impl Into<String>, fstype: FsType, content: impl Into<Content>) -> Self {
        Self::new(
            name,
            RegionKind::Partition {
                fstype,
                content: content.into(),
            },
        )
    }

    pub(crate) fn synthetic(name: &str, start: SizeType, size: SizeType, kind: RegionKind) -> Self {
        Self {
            name: name.to_owned(),
            start,
            size,
            kind,
        }
    }

    /// Set a fixed start.
    pub fn with_start(mut self, start: SizeType) -> Self {
        self.start = start;
        self
    }

    /// Set a fixed size.
    pub fn with_size(mut self, size: SizeType) -> Self {
        self.size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> SizeType {
        self.start
    }

    pub fn size(&self) -> SizeType {
        self.size
    }

    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut RegionKind {
        &mut self.kind
    }

    pub fn set_start(&mut self, start: SizeType) {
        self.start = start;
    }

    pub fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    /// The end of the region, i.e., the first byte after it.
    pub fn end(&self) -> Result<SizeType> {
        Ok((self.start + self.size)?)
    }

    /// Indicates whether the region is a partition.
    pub fn is_partition(&self) -> bool {
        matches!(self.kind, RegionKind::Partition { .. })
    }

    /// The filesystem type, if the region is a partition.
    pub fn fstype(&self) -> Option<FsType> {
        match &self.kind {
            RegionKind::Partition { fstype, .. } => Some(*fstype),
            _ => None,
        }
    }

    /// The content, if any.
    pub fn content(&self) -> Option<&Content> {
        match &self.kind {
            RegionKind::Raw(content) | RegionKind::Partition { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Resolve the size of the region.
    ///
    /// A defined region size is pushed into the content before preparing it. An
    /// undefined region size is taken from the content afterwards.
    pub fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if let RegionKind::Raw(content) | RegionKind::Partition { content, .. } = &mut self.kind {
            if self.size.is_defined() {
                content.set_size(self.size);
            }
            content.prepare(ctx)?;
            let content_size = content.size();
            if self.size.is_undefined() {
                self.size = content_size;
            } else if content_size != self.size {
                bail!(
                    "Content of '{}' has size {}, but the region has size {}",
                    self.name,
                    content_size,
                    self.size
                );
            }
        }
        if self.size.is_undefined() {
            bail!("Size of '{}' is undefined", self.name);
        }
        Ok(())
    }

    /// Write the region into the image file.
    pub fn write(&mut self, ctx: &BuildContext, file: &mut File) -> Result<()> {
        let start = self.start.bytes()?;
        match &mut self.kind {
            RegionKind::Raw(content) | RegionKind::Partition { content, .. } => {
                file.seek(SeekFrom::Start(start))
                    .context("unable to seek in image")?;
                content.write(ctx, file)?;
            }
            RegionKind::MbrHeader {
                disk_id: Some(disk_id),
            } => {
                file.seek(SeekFrom::Start(MBR_DISK_ID_OFFSET as u64))
                    .context("unable to seek in image")?;
                file.write_all(&disk_id.into_raw().to_le_bytes())
                    .context("unable to write disk id")?;
            }
            RegionKind::GptTable {
                relocated: true,
                backup_start,
            } => {
                write_relocated_gpt_table(file, start, backup_start.bytes()?)
                    .context("unable to relocate GPT partition entries")?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Point the primary GPT header to entries at `table_start` and copy the entries
/// from the backup at `backup_start` there.
fn write_relocated_gpt_table(
    file: &mut File,
    table_start: u64,
    backup_start: u64,
) -> std::io::Result<()> {
    let lba = table_start / SECTOR_SIZE;
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET + GPT_ENTRIES_LBA_FIELD))?;
    file.write_all(&lba.to_le_bytes())?;

    let mut header_size = [0; 4];
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET + GPT_HEADER_SIZE_FIELD))?;
    file.read_exact(&mut header_size)?;
    let header_size = u32::from_le_bytes(header_size);
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET + GPT_HEADER_CRC_FIELD))?;
    file.write_all(&[0; 4])?;
    let mut header = vec![0; header_size as usize];
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET))?;
    file.read_exact(&mut header)?;
    let crc = crc32fast::hash(&header);
    file.seek(SeekFrom::Start(GPT_HEADER_OFFSET + GPT_HEADER_CRC_FIELD))?;
    file.write_all(&crc.to_le_bytes())?;

    let mut entries = vec![0; GPT_TABLE_SIZE as usize];
    file.seek(SeekFrom::Start(backup_start))?;
    file.read_exact(&mut entries)?;
    file.seek(SeekFrom::Start(table_start))?;
    file.write_all(&entries)
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .end()
            .map(|end| end.hex_bytes())
            .unwrap_or_else(|_| "undefined".to_owned());
        write!(f, "{} - {end} ", self.start.hex_bytes())?;
        match &self.kind {
            RegionKind::Partition { fstype, content } => {
                write!(f, "Part {} ({fstype:?}, {})\n    {content}", self.name, self.size)
            }
            RegionKind::Raw(content) => write!(f, "Raw {} ({})\n    {content}", self.name, self.size),
            _ => write!(f, "{} ({})", self.name, self.size),
        }
    }
}
