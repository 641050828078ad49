//! Utilities for reading streamed images.

use std::collections::VecDeque;
use std::fmt::Display;
use std::io::{self, Read};

use thiserror::Error;

use super::gpt::{Guid, GPT_ATTR_LEGACY_BIOS_BOOTABLE, GPT_ENTRY_COUNT, GPT_ENTRY_SIZE};
use super::mbr::{MbrId, MBR_DISK_ID_OFFSET, MBR_ENTRIES_OFFSET, MBR_ENTRY_SIZE};
use super::{DiskId, PartitionType};

/// Standard sector size is 512 bytes.
const SECTOR_SIZE: usize = 512;
/// Standard sector size of 512 bytes as [`u64`].
const SECTOR_SIZE_U64: u64 = SECTOR_SIZE as u64;

/// Size of the read buffer.
const BUFFER_SIZE: usize = 16 * SECTOR_SIZE;
/// Size of the read buffer as [`u64`].
const BUFFER_SIZE_U64: u64 = BUFFER_SIZE as u64;

/// An image which is being streamed.
///
/// Partitions are yielded in the order of their start sectors. Logical partitions
/// are found by following the EBR chain of the extended partition.
pub struct ImgStream<R> {
    /// The inner reader.
    reader: R,
    /// The current position.
    position: u64,
    /// The buffer for reading a sector.
    buffer: Vec<u8>,
    /// The disk id.
    disk_id: DiskId,
    /// The pending partition entries.
    pending: VecDeque<PartitionEntry>,
    /// The extended partition entry of the MBR.
    extended: Option<PartitionEntry>,
    /// The starting LBA of the GPT partition entries.
    gpt_entries_lba: Option<u64>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut value = [0; 4];
    value.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(value)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut value = [0; 8];
    value.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(value)
}

impl<R: Read> ImgStream<R> {
    pub fn new(reader: R) -> Result<Self, ImgStreamError> {
        let mut this = Self {
            reader,
            position: 0,
            buffer: vec![0; BUFFER_SIZE],
            disk_id: DiskId::Mbr(MbrId::new(0)),
            pending: VecDeque::new(),
            extended: None,
            gpt_entries_lba: None,
        };
        this.read_next_sector()?;
        if this.buffer[SECTOR_SIZE - 2..SECTOR_SIZE] != [0x55, 0xAA] {
            return Err(ImgStreamError::Invalid("invalid magic bytes in MBR"));
        }
        this.disk_id = DiskId::Mbr(MbrId::new(read_u32(&this.buffer, MBR_DISK_ID_OFFSET)));
        for entry in parse_partition_table(&this.buffer[..SECTOR_SIZE]) {
            if entry.is_extended() {
                if this.extended.is_some() {
                    return Err(ImgStreamError::Invalid(
                        "more than one extended partition entry in MBR",
                    ));
                }
                this.extended = Some(entry.clone());
            }
            this.pending.push_back(entry);
        }
        // A single protective entry indicates a GUID partition table.
        if this.pending.len() == 1 && this.pending[0].is_gpt_protective_mbr() {
            this.pending.clear();
            this.read_gpt()?;
        }
        Ok(this)
    }

    /// Read the primary GPT header and its partition entries.
    fn read_gpt(&mut self) -> Result<(), ImgStreamError> {
        self.read_next_sector()?;
        let header = &self.buffer[..SECTOR_SIZE];
        if !header.starts_with(b"EFI PART") {
            return Err(ImgStreamError::Invalid("invalid GPT signature"));
        }
        let header_size = read_u32(header, 12) as usize;
        if !(92..=SECTOR_SIZE).contains(&header_size) {
            return Err(ImgStreamError::Invalid("invalid GPT header size"));
        }
        let mut checked = header[..header_size].to_vec();
        checked[16..20].fill(0);
        if crc32fast::hash(&checked) != read_u32(header, 16) {
            return Err(ImgStreamError::Invalid("invalid GPT header checksum"));
        }
        let mut disk_guid = [0; 16];
        disk_guid.copy_from_slice(&header[56..72]);
        self.disk_id = DiskId::Gpt(Guid::from_bytes(disk_guid));
        let entries_lba = read_u64(header, 72);
        let num_partitions = read_u32(header, 80);
        if num_partitions > GPT_ENTRY_COUNT {
            return Err(ImgStreamError::Invalid("too many GPT partitions"));
        }
        if read_u32(header, 84) != GPT_ENTRY_SIZE {
            return Err(ImgStreamError::Invalid("invalid GPT entry size"));
        }
        let entries_crc = read_u32(header, 88);
        self.advance_to(entries_lba * SECTOR_SIZE_U64)?;
        self.gpt_entries_lba = Some(entries_lba);
        let entry_size = GPT_ENTRY_SIZE as usize;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = num_partitions as usize;
        let mut entries = Vec::new();
        while remaining > 0 {
            self.read_next_sector()?;
            let in_sector = remaining.min(SECTOR_SIZE / entry_size);
            hasher.update(&self.buffer[..in_sector * entry_size]);
            for idx in 0..in_sector {
                let entry = &self.buffer[idx * entry_size..(idx + 1) * entry_size];
                let mut ty = [0; 16];
                ty.copy_from_slice(&entry[..16]);
                let ty = PartitionType::Gpt(Guid::from_bytes(ty));
                if ty.is_free() {
                    continue;
                }
                let start = read_u64(entry, 32);
                let end = read_u64(entry, 40);
                entries.push(PartitionEntry {
                    ty,
                    start,
                    size: end + 1 - start,
                    bootable: read_u64(entry, 48) & GPT_ATTR_LEGACY_BIOS_BOOTABLE != 0,
                });
            }
            remaining -= in_sector;
        }
        if hasher.finalize() != entries_crc {
            return Err(ImgStreamError::Invalid("invalid GPT partition entries checksum"));
        }
        entries.sort_by_key(|entry| entry.start);
        self.pending = entries.into();
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// The disk id.
    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    /// The extended partition entry of the MBR, if any.
    pub fn extended(&self) -> Option<&PartitionEntry> {
        self.extended.as_ref()
    }

    /// The starting LBA of the GPT partition entries, if any.
    pub fn gpt_entries_lba(&self) -> Option<u64> {
        self.gpt_entries_lba
    }

    /// Fill the buffer with the next sector.
    fn read_next_sector(&mut self) -> io::Result<()> {
        if self.position % SECTOR_SIZE_U64 != 0 {
            return Err(io::Error::other(
                "invalid sector reading at unaligned position",
            ));
        }
        self.reader.read_exact(&mut self.buffer[..SECTOR_SIZE])?;
        self.position += SECTOR_SIZE_U64;
        Ok(())
    }

    /// Advance the reader to the given position.
    fn advance_to(&mut self, start_position: u64) -> Result<(), ImgStreamError> {
        if start_position < self.position {
            return Err(ImgStreamError::Invalid(
                "invalid start sector or unsupported partition order",
            ));
        }
        let skip_bytes = start_position - self.position;
        let skip_unaligned = (skip_bytes % BUFFER_SIZE_U64) as usize;
        if skip_unaligned > 0 {
            // Realign the reader with the sector/buffer size.
            self.reader.read_exact(&mut self.buffer[..skip_unaligned])?;
        }
        for _ in 0..(skip_bytes / BUFFER_SIZE_U64) {
            self.reader.read_exact(&mut self.buffer)?;
        }
        self.position = start_position;
        Ok(())
    }

    /// Return next partition to be read.
    pub fn next_partition(&mut self) -> Result<Option<PartitionStream<'_, R>>, ImgStreamError> {
        loop {
            let Some(entry) = self.pending.pop_front() else {
                return Ok(None);
            };
            // Advance reader to the start of the partition entry.
            self.advance_to(entry.start_bytes())?;
            if entry.is_extended() {
                // The entry points to an EBR, read the EBR.
                self.read_next_sector()?;
                let mut entries = parse_partition_table(&self.buffer[..SECTOR_SIZE]);
                if let Some(mut first) = entries.next() {
                    if first.is_extended() {
                        return Err(ImgStreamError::Invalid("invalid first entry of EBR"));
                    }
                    // Address of partition is relative to this EBR.
                    first.start += entry.start;
                    self.pending.push_back(first);
                }
                if let Some(mut second) = entries.next() {
                    if !second.is_extended() {
                        return Err(ImgStreamError::Invalid("invalid second entry of EBR"));
                    }
                    let Some(extended) = &self.extended else {
                        return Err(ImgStreamError::Invalid("EBR without extended partition"));
                    };
                    // Address of next EBR is relative to first EBR.
                    second.start += extended.start;
                    self.pending.push_back(second);
                }
            } else {
                break Ok(Some(PartitionStream {
                    stream: self,
                    remaining: entry.size_bytes(),
                    entry,
                }));
            }
        }
    }
}

/// Reader for a partition.
pub struct PartitionStream<'stream, R> {
    /// The underlying image stream.
    stream: &'stream mut ImgStream<R>,
    /// The number of remaining bytes of the partition.
    remaining: u64,
    /// The entry of the partition.
    entry: PartitionEntry,
}

impl<R> PartitionStream<'_, R> {
    /// The entry of the partition.
    pub fn entry(&self) -> &PartitionEntry {
        &self.entry
    }

    /// The number of remaining bytes.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read> Read for PartitionStream<'_, R> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining < buf.len() as u64 {
            if self.remaining == 0 {
                // Nothing more to read, indicate EOF.
                return Ok(0);
            }
            // Clamp the buffer to the number of bytes remaining in the partition.
            buf = &mut buf[..self.remaining as usize];
        }
        let size = self.stream.reader.read(buf)?;
        self.remaining -= size as u64;
        self.stream.position += size as u64;
        Ok(size)
    }
}

/// Error reading an image stream.
#[derive(Debug, Error)]
pub enum ImgStreamError {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Invalid partition table.
    #[error("{0}")]
    Invalid(&'static str),
}

/// Parse the entries of the partition table of a boot record.
///
/// Free entries are skipped. The slice must hold a complete 512-byte record.
pub fn parse_partition_table(record: &[u8]) -> impl '_ + Iterator<Item = PartitionEntry> {
    (0..4)
        .filter_map(move |entry_idx| {
            let entry_start = MBR_ENTRIES_OFFSET + entry_idx * MBR_ENTRY_SIZE;
            record
                .get(entry_start..entry_start + MBR_ENTRY_SIZE)
                .map(PartitionEntry::from_bytes_mbr)
        })
        .filter(|entry| !entry.is_free())
}

/// An entry in a partition table using LBA addressing.
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    /// The kind of the partition.
    ty: PartitionType,
    /// The start sector.
    start: u64,
    /// The size of the partition in sectors.
    size: u64,
    /// Boot flag or legacy BIOS bootable attribute.
    bootable: bool,
}

impl PartitionEntry {
    /// Parse a partition entry from the given 16 bytes.
    fn from_bytes_mbr(entry: &[u8]) -> Self {
        Self {
            ty: PartitionType::Mbr(entry[4]),
            start: read_u32(entry, 8).into(),
            size: read_u32(entry, 12).into(),
            bootable: entry[0] & 0x80 != 0,
        }
    }

    /// Indicates whether the partition entry is free.
    fn is_free(&self) -> bool {
        // Free entries in the partition table have their type set to 0x00.
        self.ty.is_free()
    }

    /// Indicates whether the partition entry points to an EBR.
    pub fn is_extended(&self) -> bool {
        // Technically, 0x05 would use CHS addressing, but modern tools provide
        // LBA addressing anyway and converting is non-trivial, hence, we will
        // just rely on LBA addressing everywhere.
        self.ty.is_extended()
    }

    /// Indicates whether the partition entry is a protective MBR entry.
    fn is_gpt_protective_mbr(&self) -> bool {
        matches!(self.ty, PartitionType::Mbr(0xEE))
    }

    /// The type of the partition.
    pub fn ty(&self) -> &PartitionType {
        &self.ty
    }

    /// The start sector.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The size in sectors.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Indicates whether the partition is marked bootable.
    pub fn is_bootable(&self) -> bool {
        self.bootable
    }

    /// The size of the partition in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size * SECTOR_SIZE_U64
    }

    /// The start of the partition in bytes.
    pub fn start_bytes(&self) -> u64 {
        self.start * SECTOR_SIZE_U64
    }
}

impl Display for PartitionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "type: {}, start: {}, size: {}",
            self.ty, self.start, self.size
        ))?;
        if self.bootable {
            f.write_str(", bootable")?;
        }
        Ok(())
    }
}
