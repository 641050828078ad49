//! Partition table labels and the layout of their regions.
//!
//! A [`Label`] owns all regions of an image, including synthetic regions for the
//! partition table structures themselves. Preparing a label resolves the sizes and
//! starts of all regions and validates that they do not overlap. Creating an image
//! then writes the partition table and all regions into a file.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::context::BuildContext;
use crate::disk::gpt::Guid;
use crate::disk::mbr::MbrId;
use crate::disk::{NativeBackend, PartitionTableDef, PartitionTableType, TableBackend};
use crate::fsutils::allocate_file;
use crate::region::{Region, RegionKind};
use crate::size::SizeType;
use crate::{bail, Error, IoContext, Result};

pub mod gpt;
pub mod mbr;

pub use self::gpt::GPT_RELOCATION_NOTICE;

/// Partition table specific parts of a label.
#[derive(Debug, Clone, Copy)]
enum LabelKind {
    Mbr,
    Gpt { disk_guid: Option<Guid> },
}

/// Partition table label with the regions of an image.
#[derive(Debug)]
pub struct Label {
    kind: LabelKind,
    parts: Vec<Region>,
    boot_partition: Option<String>,
    prepared: bool,
}

impl Label {
    /// Create an empty label with an MBR partition table.
    pub fn mbr() -> Self {
        Self {
            kind: LabelKind::Mbr,
            parts: vec![mbr::header_region()],
            boot_partition: None,
            prepared: false,
        }
    }

    /// Create an empty label with a GUID partition table.
    pub fn gpt() -> Self {
        Self {
            kind: LabelKind::Gpt { disk_guid: None },
            parts: gpt::header_regions().into(),
            boot_partition: None,
            prepared: false,
        }
    }

    /// Create an empty label of the given type.
    pub fn new(ty: PartitionTableType) -> Self {
        match ty {
            PartitionTableType::Mbr => Self::mbr(),
            PartitionTableType::Gpt => Self::gpt(),
        }
    }

    /// Type of the partition table.
    pub fn ty(&self) -> PartitionTableType {
        match self.kind {
            LabelKind::Mbr => PartitionTableType::Mbr,
            LabelKind::Gpt { .. } => PartitionTableType::Gpt,
        }
    }

    /// Add a region.
    pub fn push(&mut self, region: Region) {
        self.parts.push(region);
    }

    /// Add a region.
    pub fn with_part(mut self, region: Region) -> Self {
        self.push(region);
        self
    }

    /// All regions, sorted by their start once the label has been prepared.
    pub fn parts(&self) -> &[Region] {
        &self.parts
    }

    /// Look up a region by its name.
    pub fn part(&self, name: &str) -> Option<&Region> {
        self.parts.iter().find(|part| part.name() == name)
    }

    /// Set the name of the partition to mark as bootable.
    pub fn set_boot_partition(&mut self, name: impl Into<String>) {
        self.boot_partition = Some(name.into());
    }

    /// Set the disk id of an MBR partition table.
    pub fn set_mbr_disk_id(&mut self, id: MbrId) -> Result<()> {
        for part in &mut self.parts {
            if let RegionKind::MbrHeader { disk_id } = part.kind_mut() {
                *disk_id = Some(id);
                return Ok(());
            }
        }
        bail!("Disk id can only be set for MBR partition tables")
    }

    /// Set the disk GUID of a GUID partition table.
    pub fn set_gpt_disk_guid(&mut self, guid: Guid) -> Result<()> {
        match &mut self.kind {
            LabelKind::Gpt { disk_guid } => {
                *disk_guid = Some(guid);
                Ok(())
            }
            LabelKind::Mbr => bail!("Disk GUID can only be set for GUID partition tables"),
        }
    }

    /// Indicates whether the primary GPT partition entries have been moved.
    pub fn gpt_table_relocated(&self) -> bool {
        self.parts.iter().any(|part| {
            matches!(
                part.kind(),
                RegionKind::GptTable {
                    relocated: true,
                    ..
                }
            )
        })
    }

    /// Size of the image, i.e., the end of the last region.
    pub fn image_size(&self) -> Result<u64> {
        let mut size = 0;
        for part in &self.parts {
            size = size.max(part.end()?.bytes()?);
        }
        Ok(size)
    }

    /// Resolve sizes and starts of all regions and validate the layout.
    pub fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if self.prepared {
            bail!("Label has already been prepared");
        }
        let mut names = HashSet::new();
        for part in &self.parts {
            if !names.insert(part.name()) {
                bail!("Duplicate region name '{}'", part.name());
            }
        }
        if let Some(boot) = &self.boot_partition {
            if !self
                .parts
                .iter()
                .any(|part| part.is_partition() && part.name() == boot)
            {
                bail!("Boot partition '{boot}' does not exist");
            }
        }
        for part in &mut self.parts {
            debug!("Preparing region '{}'", part.name());
            part.prepare(ctx)?;
        }
        match self.kind {
            LabelKind::Mbr => mbr::insert_ebr_headers(&mut self.parts)?,
            LabelKind::Gpt { .. } => gpt::relocate_table(&mut self.parts)?,
        }
        place_parts(&mut self.parts)?;
        validate_parts(&mut self.parts)?;
        match self.kind {
            LabelKind::Mbr => mbr::check_ebr_headers(&self.parts)?,
            LabelKind::Gpt { .. } => gpt::append_backup(&mut self.parts)?,
        }
        self.prepared = true;
        Ok(())
    }

    /// Compute the partition table of the prepared label.
    ///
    /// Random disk ids are used unless configured.
    pub fn partition_table(&self) -> Result<PartitionTableDef> {
        if !self.prepared {
            bail!("Label must be prepared before computing the partition table");
        }
        let image_size = self.image_size()?;
        let boot = self.boot_partition.as_deref();
        match self.kind {
            LabelKind::Mbr => {
                let disk_id = self
                    .parts
                    .iter()
                    .find_map(|part| match part.kind() {
                        RegionKind::MbrHeader { disk_id } => *disk_id,
                        _ => None,
                    })
                    .unwrap_or_else(MbrId::random);
                mbr::partition_table(&self.parts, boot, disk_id, image_size)
            }
            LabelKind::Gpt { disk_guid } => gpt::partition_table(
                &self.parts,
                boot,
                disk_guid.unwrap_or_else(Guid::random),
                image_size,
            ),
        }
    }

    /// Create the image at `path` with the native partition table backend.
    pub fn create(&mut self, ctx: &BuildContext, path: &Path) -> Result<()> {
        self.create_with(ctx, path, &NativeBackend)
    }

    /// Create the image at `path` using the given partition table backend.
    pub fn create_with(
        &mut self,
        ctx: &BuildContext,
        path: &Path,
        backend: &dyn TableBackend,
    ) -> Result<()> {
        let table = self.partition_table()?;
        let size = self.image_size()?;
        info!("Allocating image of {}.", SizeType::new(size));
        allocate_file(path, size).context(format!("unable to allocate {}", path.display()))?;
        info!(
            "Writing {} partition table with {} backend.",
            table.ty(),
            backend.name()
        );
        backend.commit(path, &table)?;
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(format!("unable to open image {}", path.display()))?;
        for part in &mut self.parts {
            debug!("Writing region '{}'", part.name());
            part.write(ctx, &mut file)?;
        }
        file.sync_all().context("unable to sync image")
    }
}

/// Sort regions by start and assign starts to floating regions.
///
/// Floating regions keep their relative order and are placed after the fixed ones.
fn place_parts(parts: &mut [Region]) -> Result<()> {
    parts.sort_by_key(|part| part.start().sort_key());
    let mut cur_offset = SizeType::ZERO;
    for part in parts.iter_mut() {
        if part.start().is_undefined() {
            part.set_start(cur_offset);
        }
        cur_offset = part.end()?;
    }
    Ok(())
}

/// Check that no region starts before the end of its predecessor.
fn validate_parts(parts: &mut [Region]) -> Result<()> {
    parts.sort_by_key(|part| part.start().sort_key());
    let mut cur_offset = SizeType::ZERO;
    let mut previous: Option<&Region> = None;
    for part in parts.iter() {
        if part.start().try_cmp(cur_offset)? == Ordering::Less {
            return Err(match previous {
                Some(previous) => Error::Overlap {
                    part: part.name().to_owned(),
                    previous: previous.name().to_owned(),
                },
                None => Error::Misplaced {
                    part: part.name().to_owned(),
                    start: part.start(),
                    expected: cur_offset,
                },
            });
        }
        cur_offset = part.end()?;
        previous = Some(part);
    }
    Ok(())
}

/// Start and size of a partition in sectors.
fn partition_sectors(part: &Region) -> Result<(u64, u64)> {
    let (Ok(start), Ok(size)) = (part.start().sectors(), part.size().sectors()) else {
        bail!("Partition '{}' is not aligned to sectors", part.name());
    };
    if size == 0 {
        bail!("Partition '{}' has size zero", part.name());
    }
    Ok((start, size))
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LabelKind::Mbr => writeln!(f, "MBR label")?,
            LabelKind::Gpt { .. } => writeln!(f, "GPT label")?,
        }
        for part in &self.parts {
            writeln!(f, "  {part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::EmptyContent;

    fn empty(name: &str, start: Option<u64>, size: u64) -> Region {
        let region = Region::raw(name, EmptyContent::new()).with_size(SizeType::new(size));
        match start {
            Some(start) => region.with_start(SizeType::new(start)),
            None => region,
        }
    }

    fn starts(label: &Label) -> Vec<(&str, u64)> {
        label
            .parts()
            .iter()
            .map(|part| (part.name(), part.start().bytes().unwrap()))
            .collect()
    }

    #[test]
    fn test_fixed_regions_keep_positions() {
        let mut ctx = BuildContext::new().unwrap();
        let mut label = Label::mbr()
            .with_part(empty("b", Some(4096), 512))
            .with_part(empty("a", Some(1024), 1024));
        label.prepare(&mut ctx).unwrap();
        assert_eq!(
            starts(&label),
            [("MBR Header", 0x1B8), ("a", 1024), ("b", 4096)]
        );
        assert_eq!(label.parts()[2].size(), SizeType::new(512));
    }

    #[test]
    fn test_floating_regions_follow_fixed_ones() {
        let mut ctx = BuildContext::new().unwrap();
        let mut label = Label::mbr()
            .with_part(empty("x", None, 512))
            .with_part(empty("fixed", Some(2048), 512))
            .with_part(empty("y", None, 1024));
        label.prepare(&mut ctx).unwrap();
        assert_eq!(
            starts(&label),
            [
                ("MBR Header", 0x1B8),
                ("fixed", 2048),
                ("x", 2560),
                ("y", 3072)
            ]
        );
        assert_eq!(label.image_size().unwrap(), 4096);
    }

    #[test]
    fn test_overlap_names_both_regions() {
        let mut ctx = BuildContext::new().unwrap();
        let mut label = Label::mbr()
            .with_part(empty("first", Some(1024), 1024))
            .with_part(empty("second", Some(1536), 512));
        let error = label.prepare(&mut ctx).unwrap_err();
        assert_eq!(error.to_string(), "Part 'second' overlaps with 'first'");
    }

    #[test]
    fn test_duplicate_names() {
        let mut ctx = BuildContext::new().unwrap();
        let mut label = Label::mbr()
            .with_part(empty("a", None, 512))
            .with_part(empty("a", None, 512));
        assert!(label.prepare(&mut ctx).is_err());
    }

    #[test]
    fn test_prepare_twice() {
        let mut ctx = BuildContext::new().unwrap();
        let mut label = Label::mbr();
        label.prepare(&mut ctx).unwrap();
        assert!(label.prepare(&mut ctx).is_err());
    }

    #[test]
    fn test_disk_id_requires_mbr() {
        let mut label = Label::gpt();
        assert!(label.set_mbr_disk_id(MbrId::new(1)).is_err());
        assert!(Label::mbr().set_gpt_disk_guid(Guid::random()).is_err());
    }
}
