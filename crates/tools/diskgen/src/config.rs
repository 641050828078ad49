//! Data structures for representing an image configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use diskgen_core::content::{
    Content, EmptyContent, Ext4Content, Fat32Content, FilesProvider, RawContent, UBootEnvContent,
};
use diskgen_core::disk::gpt::Guid;
use diskgen_core::disk::mbr::MbrId;
use diskgen_core::disk::PartitionTableType;
use diskgen_core::generator::{Split, SplitArchiveGenerator};
use diskgen_core::{BuildContext, FsType, Label, Region, SizeType};

/// Image configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The image to build.
    pub image: ImageConfig,
    /// Content generators which can be referenced by name.
    #[serde(default)]
    pub contents: Vec<GeneratorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// The type of the partition table.
    #[serde(rename = "type")]
    pub ty: PartitionTableType,
    /// Name of the partition to mark as bootable.
    pub boot_partition: Option<String>,
    /// Disk id of an MBR partition table.
    pub disk_id: Option<u32>,
    /// Disk GUID of a GUID partition table.
    pub disk_guid: Option<Guid>,
    /// The regions of the image.
    #[serde(default)]
    pub parts: Vec<PartConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PartConfig {
    /// Reserved space.
    Empty {
        name: String,
        start: Option<SizeType>,
        size: Option<SizeType>,
    },
    /// Content outside of any partition.
    Raw {
        name: String,
        start: Option<SizeType>,
        size: Option<SizeType>,
        content: ContentConfig,
    },
    /// Partition with an entry in the partition table.
    Partition {
        name: String,
        fstype: FsType,
        start: Option<SizeType>,
        size: Option<SizeType>,
        content: Option<ContentConfig>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ContentConfig {
    Empty,
    Raw {
        file: PathBuf,
        #[serde(default)]
        offset: u64,
    },
    UbootEnv {
        file: Option<PathBuf>,
        #[serde(default)]
        vars: BTreeMap<String, String>,
    },
    Ext4 {
        content: Option<FilesConfig>,
    },
    Fat32 {
        content: Option<FilesConfig>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FilesConfig {
    Files { files: Vec<PathBuf> },
    Archive { archive: PathBuf },
    Ref { name: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum GeneratorConfig {
    SplitArchive {
        name: String,
        archive: PathBuf,
        remaining: Option<String>,
        #[serde(default)]
        splits: Vec<SplitConfig>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub remove_root: bool,
}

/// Load the configuration from the given file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("unable to read configuration {}", path.display()))?;
    toml::from_str(&source)
        .with_context(|| format!("unable to parse configuration {}", path.display()))
}

impl Config {
    /// Register the content generators and build the label.
    ///
    /// Relative paths are resolved against `base_dir`.
    pub fn into_label(self, base_dir: &Path, ctx: &mut BuildContext) -> anyhow::Result<Label> {
        for generator in self.contents {
            ctx.register(generator.into_generator(base_dir))?;
        }
        let image = self.image;
        let mut label = Label::new(image.ty);
        if let Some(disk_id) = image.disk_id {
            label.set_mbr_disk_id(MbrId::new(disk_id))?;
        }
        if let Some(disk_guid) = image.disk_guid {
            label.set_gpt_disk_guid(disk_guid)?;
        }
        if let Some(boot) = image.boot_partition {
            label.set_boot_partition(boot);
        }
        for part in image.parts {
            label.push(part.into_region(base_dir));
        }
        Ok(label)
    }
}

fn with_position(region: Region, start: Option<SizeType>, size: Option<SizeType>) -> Region {
    let region = match start {
        Some(start) => region.with_start(start),
        None => region,
    };
    match size {
        Some(size) => region.with_size(size),
        None => region,
    }
}

impl PartConfig {
    fn into_region(self, base_dir: &Path) -> Region {
        match self {
            PartConfig::Empty { name, start, size } => {
                with_position(Region::empty(name), start, size)
            }
            PartConfig::Raw {
                name,
                start,
                size,
                content,
            } => with_position(Region::raw(name, content.into_content(base_dir)), start, size),
            PartConfig::Partition {
                name,
                fstype,
                start,
                size,
                content,
            } => {
                let content = match content {
                    Some(content) => content.into_content(base_dir),
                    None => EmptyContent::new().into(),
                };
                with_position(Region::partition(name, fstype, content), start, size)
            }
        }
    }
}

impl ContentConfig {
    fn into_content(self, base_dir: &Path) -> Content {
        match self {
            ContentConfig::Empty => EmptyContent::new().into(),
            ContentConfig::Raw { file, offset } => RawContent::new(base_dir.join(file))
                .with_offset(offset)
                .into(),
            ContentConfig::UbootEnv { file, vars } => {
                let mut content = UBootEnvContent::new();
                if let Some(file) = file {
                    content = content.with_file(base_dir.join(file));
                }
                for (key, value) in vars {
                    content = content.with_var(&key, value);
                }
                content.into()
            }
            ContentConfig::Ext4 { content } => {
                let mut ext4 = Ext4Content::new();
                if let Some(files) = content {
                    ext4 = ext4.with_files(files.into_provider(base_dir));
                }
                ext4.into()
            }
            ContentConfig::Fat32 { content } => {
                let mut fat32 = Fat32Content::new();
                if let Some(files) = content {
                    fat32 = fat32.with_files(files.into_provider(base_dir));
                }
                fat32.into()
            }
        }
    }
}

impl FilesConfig {
    fn into_provider(self, base_dir: &Path) -> FilesProvider {
        match self {
            FilesConfig::Files { files } => {
                FilesProvider::files(files.into_iter().map(|file| base_dir.join(file)))
            }
            FilesConfig::Archive { archive } => FilesProvider::archive(base_dir.join(archive)),
            FilesConfig::Ref { name } => FilesProvider::reference(name),
        }
    }
}

impl GeneratorConfig {
    fn into_generator(self, base_dir: &Path) -> SplitArchiveGenerator {
        match self {
            GeneratorConfig::SplitArchive {
                name,
                archive,
                remaining,
                splits,
            } => {
                let mut generator = SplitArchiveGenerator::new(name, base_dir.join(archive));
                for split in splits {
                    generator = generator.with_split(Split {
                        name: split.name,
                        root: split.root,
                        remove_root: split.remove_root,
                    });
                }
                if let Some(remaining) = remaining {
                    generator = generator.with_remaining(remaining);
                }
                generator
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [image]
        type = "mbr"
        boot_partition = "boot"
        disk_id = 0xdeadbeef

        [[contents]]
        type = "split_archive"
        name = "rootfs"
        archive = "rootfs.tar"
        remaining = "root"
        splits = [{ name = "boot", root = "boot" }]

        [[image.parts]]
        type = "raw"
        name = "env"
        start = "8 K"
        size = 1024
        content = { type = "uboot_env", vars = { bootdelay = "0" } }

        [[image.parts]]
        type = "partition"
        name = "boot"
        fstype = "fat32"
        start = "1 MB"
        size = "64 MB"
        content = { type = "fat32", content = { type = "ref", name = "rootfs.boot" } }

        [[image.parts]]
        type = "partition"
        name = "root"
        fstype = "ext4"
        size = "512 MB"
        content = { type = "ext4", content = { type = "ref", name = "rootfs.root" } }
    "#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.image.ty, PartitionTableType::Mbr);
        assert_eq!(config.image.disk_id, Some(0xdeadbeef));
        assert_eq!(config.contents.len(), 1);
        assert_eq!(config.image.parts.len(), 3);
        let PartConfig::Partition {
            fstype, start, size, ..
        } = &config.image.parts[1]
        else {
            panic!("expected partition");
        };
        assert_eq!(*fstype, FsType::Fat32);
        assert_eq!(*start, Some(SizeType::new(1024 * 1024)));
        assert_eq!(*size, Some(SizeType::new(64 * 1024 * 1024)));
    }

    #[test]
    fn test_into_label() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let mut ctx = BuildContext::new().unwrap();
        let label = config.into_label(Path::new("/images"), &mut ctx).unwrap();
        assert_eq!(
            ctx.keys().collect::<Vec<_>>(),
            ["rootfs.boot", "rootfs.root"]
        );
        assert_eq!(label.ty(), PartitionTableType::Mbr);
        assert!(label.part("env").is_some());
        assert_eq!(label.part("root").unwrap().start(), SizeType::UNDEFINED);
    }

    #[test]
    fn test_unknown_field() {
        let result = toml::from_str::<Config>("[image]\ntype = \"gpt\"\nsize = 10\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_part_field() {
        let source = r#"
            [image]
            type = "gpt"

            [[image.parts]]
            type = "partition"
            name = "root"
            fstype = "ext4"
            sise = "4 MB"
        "#;
        let error = toml::from_str::<Config>(source).unwrap_err();
        assert!(error.to_string().contains("sise"));
    }

    #[test]
    fn test_unknown_content_field() {
        let source = r#"
            [image]
            type = "mbr"

            [[image.parts]]
            type = "raw"
            name = "blob"
            content = { type = "raw", file = "blob.bin", ofset = 10 }
        "#;
        assert!(toml::from_str::<Config>(source).is_err());
        let source = source.replace("ofset = 10", "offset = 10");
        assert!(toml::from_str::<Config>(&source).is_ok());
    }
}
