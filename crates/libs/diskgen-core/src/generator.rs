//! Generators producing named sets of files from a single source.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::info;

use crate::content::{list_dir, ProvidedFiles};
use crate::fakeroot::FakeRoot;
use crate::{bail, IoContext, Result};

/// Part produced by a [`SplitArchiveGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedPart {
    /// The split with the given index.
    Split(usize),
    /// Everything not moved into any split.
    Remaining,
}

/// Split of an archive.
#[derive(Debug, Clone)]
pub struct Split {
    /// Name of the split, registered as `<generator>.<name>`.
    pub name: String,
    /// Directory in the archive whose entries are moved into the split.
    pub root: PathBuf,
    /// Remove the then empty root directory from the archive tree.
    pub remove_root: bool,
}

/// Extracts an archive once and splits its tree into several sets of files.
///
/// For instance, the `/boot` directory of a root filesystem archive may go into a
/// FAT32 boot partition while the remaining tree goes into an ext4 root partition.
#[derive(Debug)]
pub struct SplitArchiveGenerator {
    name: String,
    archive: PathBuf,
    splits: Vec<Split>,
    remaining: Option<String>,
    extracted: Option<Extracted>,
}

#[derive(Debug)]
struct Extracted {
    tree: TempDir,
    splits: Vec<TempDir>,
    fakeroot: FakeRoot,
}

impl SplitArchiveGenerator {
    /// Create a generator for the given archive.
    pub fn new(name: impl Into<String>, archive: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            archive: archive.into(),
            splits: Vec::new(),
            remaining: None,
            extracted: None,
        }
    }

    /// Add a split.
    pub fn with_split(mut self, split: Split) -> Self {
        self.splits.push(split);
        self
    }

    /// Provide the remaining tree under the given name.
    pub fn with_remaining(mut self, name: impl Into<String>) -> Self {
        self.remaining = Some(name.into());
        self
    }

    /// The name of the generator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys provided by this generator.
    pub fn keys(&self) -> Vec<(String, GeneratedPart)> {
        let mut keys = self
            .splits
            .iter()
            .enumerate()
            .map(|(idx, split)| {
                (
                    format!("{}.{}", self.name, split.name),
                    GeneratedPart::Split(idx),
                )
            })
            .collect::<Vec<_>>();
        if let Some(remaining) = &self.remaining {
            keys.push((
                format!("{}.{remaining}", self.name),
                GeneratedPart::Remaining,
            ));
        }
        keys
    }

    /// Extract and split the archive unless this has been done already.
    pub(crate) fn prepare(&mut self, work_dir: &Path, fakeroot: FakeRoot) -> Result<()> {
        if self.extracted.is_some() {
            return Ok(());
        }
        info!("Extracting archive {}", self.archive.display());
        let tree = temp_dir_in(work_dir, "archive-")?;
        fakeroot.run(
            "tar",
            [
                OsStr::new("-xpf"),
                self.archive.as_os_str(),
                OsStr::new("-C"),
                tree.path().as_os_str(),
            ],
        )?;
        let mut splits = Vec::new();
        for split in &self.splits {
            let root = tree.path().join(split.root.strip_prefix("/").unwrap_or(&split.root));
            if !root.is_dir() {
                bail!(
                    "Path {} is not in archive {}",
                    split.root.display(),
                    self.archive.display()
                );
            }
            let split_dir = temp_dir_in(work_dir, "split-")?;
            for entry in list_dir(&root)? {
                fakeroot.run("mv", [entry.as_os_str(), split_dir.path().as_os_str()])?;
            }
            if split.remove_root {
                fakeroot.run("rmdir", [root.as_os_str()])?;
            }
            splits.push(split_dir);
        }
        self.extracted = Some(Extracted {
            tree,
            splits,
            fakeroot,
        });
        Ok(())
    }

    /// Files of the given part.
    pub(crate) fn files(&self, part: &GeneratedPart) -> Result<ProvidedFiles> {
        let Some(extracted) = &self.extracted else {
            bail!("archive {} has not been extracted", self.archive.display());
        };
        let dir = match part {
            GeneratedPart::Split(idx) => extracted.splits[*idx].path(),
            GeneratedPart::Remaining => extracted.tree.path(),
        };
        Ok(ProvidedFiles {
            files: list_dir(dir)?,
            fakeroot: Some(extracted.fakeroot.clone()),
        })
    }
}

fn temp_dir_in(work_dir: &Path, prefix: &str) -> Result<TempDir> {
    fs::create_dir_all(work_dir).context("unable to create work directory")?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(work_dir)
        .context("unable to create temporary directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let generator = SplitArchiveGenerator::new("rootfs", "rootfs.tar")
            .with_split(Split {
                name: "boot".to_owned(),
                root: PathBuf::from("/boot"),
                remove_root: false,
            })
            .with_remaining("root");
        assert_eq!(
            generator.keys(),
            vec![
                ("rootfs.boot".to_owned(), GeneratedPart::Split(0)),
                ("rootfs.root".to_owned(), GeneratedPart::Remaining),
            ]
        );
    }
}
