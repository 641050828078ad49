//! Contents of regions.
//!
//! Every content has a [`SizeType`] which is either set by the enclosing region or
//! determined by the content itself during [`ContentType::prepare`]. Writing happens
//! into a [`Sink`] positioned at the start of the region.

use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::context::BuildContext;
use crate::fakeroot::FakeRoot;
use crate::fsutils::{copy_sparse, Sink};
use crate::size::SizeType;
use crate::{bail, Error, IoContext, Result};

mod filesystem;
mod raw;
mod uboot;

pub use self::filesystem::{Ext4Content, Fat32Content};
pub use self::raw::{EmptyContent, RawContent};
pub use self::uboot::UBootEnvContent;

/// Interface implemented by all content types.
pub trait ContentType: fmt::Display {
    /// The size of the content.
    fn size(&self) -> SizeType;

    /// Set the size of the content.
    fn set_size(&mut self, size: SizeType);

    /// Resolve the size and validate the content.
    fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()>;

    /// Write the content to the sink.
    ///
    /// Exactly `size` bytes are written.
    fn write(&mut self, ctx: &BuildContext, sink: &mut dyn Sink) -> Result<()>;
}

/// Content of a region.
#[derive(Debug)]
pub enum Content {
    Empty(EmptyContent),
    Raw(RawContent),
    UBootEnv(UBootEnvContent),
    Ext4(Ext4Content),
    Fat32(Fat32Content),
}

impl Content {
    fn inner(&self) -> &dyn ContentType {
        match self {
            Content::Empty(content) => content,
            Content::Raw(content) => content,
            Content::UBootEnv(content) => content,
            Content::Ext4(content) => content,
            Content::Fat32(content) => content,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ContentType {
        match self {
            Content::Empty(content) => content,
            Content::Raw(content) => content,
            Content::UBootEnv(content) => content,
            Content::Ext4(content) => content,
            Content::Fat32(content) => content,
        }
    }

    /// The size of the content.
    pub fn size(&self) -> SizeType {
        self.inner().size()
    }

    /// Set the size of the content.
    pub fn set_size(&mut self, size: SizeType) {
        self.inner_mut().set_size(size)
    }

    /// Resolve the size and validate the content.
    pub fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        self.inner_mut().prepare(ctx)
    }

    /// Write the content to the sink.
    pub fn write(&mut self, ctx: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        self.inner_mut().write(ctx, sink)
    }
}

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner().fmt(f)
    }
}

impl From<EmptyContent> for Content {
    fn from(content: EmptyContent) -> Self {
        Content::Empty(content)
    }
}

impl From<RawContent> for Content {
    fn from(content: RawContent) -> Self {
        Content::Raw(content)
    }
}

impl From<UBootEnvContent> for Content {
    fn from(content: UBootEnvContent) -> Self {
        Content::UBootEnv(content)
    }
}

impl From<Ext4Content> for Content {
    fn from(content: Ext4Content) -> Self {
        Content::Ext4(content)
    }
}

impl From<Fat32Content> for Content {
    fn from(content: Fat32Content) -> Self {
        Content::Fat32(content)
    }
}

/// Content materialized once into a temporary file.
///
/// The first write produces the file, every write copies it sparsely.
#[derive(Debug, Default)]
pub struct ResultFile {
    path: Option<PathBuf>,
}

impl ResultFile {
    /// Path of the materialized file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Produce the file unless this has been done already.
    pub fn materialize<F>(&mut self, ctx: &BuildContext, suffix: &str, produce: F) -> Result<&Path>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let path = match self.path.take() {
            Some(path) => path,
            None => {
                let path = ctx.temp_path("content-", suffix);
                produce(&path)?;
                path
            }
        };
        Ok(self.path.insert(path).as_path())
    }

    /// Copy `size` bytes of the materialized file into the sink.
    pub fn copy_to(&self, sink: &mut dyn Sink, size: u64) -> Result<()> {
        let Some(path) = &self.path else {
            bail!("content has not been materialized");
        };
        let mut file =
            File::open(path).context(format!("unable to open {}", path.display()))?;
        let len = file
            .metadata()
            .context(format!("unable to read metadata of {}", path.display()))?
            .len();
        if len != size {
            bail!("produced {len} B of content, but expected {size} B");
        }
        copy_sparse(sink, &mut file, size).context("unable to copy content")
    }

    /// Materialize and copy the file into the sink.
    pub fn write<F>(
        &mut self,
        ctx: &BuildContext,
        suffix: &str,
        size: SizeType,
        sink: &mut dyn Sink,
        produce: F,
    ) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let size = size.bytes()?;
        self.materialize(ctx, suffix, produce)?;
        self.copy_to(sink, size)
    }
}

/// Files resolved from a [`FilesProvider`].
#[derive(Debug, Clone, Default)]
pub struct ProvidedFiles {
    /// Files and directories to put into the filesystem's root.
    pub files: Vec<PathBuf>,
    /// Session preserving ownership and permissions of the files.
    pub fakeroot: Option<FakeRoot>,
}

/// Provider of files for filesystem contents.
#[derive(Debug)]
pub enum FilesProvider {
    /// Plain files from the host.
    Files(Vec<PathBuf>),
    /// Entries of an archive, extracted during preparation.
    Archive {
        archive: PathBuf,
        extracted: Option<(tempfile::TempDir, ProvidedFiles)>,
    },
    /// Files registered in the build context under the given key.
    Ref {
        key: String,
        resolved: Option<ProvidedFiles>,
    },
}

impl FilesProvider {
    /// Provide the given files.
    pub fn files(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self::Files(files.into_iter().map(Into::into).collect())
    }

    /// Provide the entries of the given archive.
    pub fn archive(archive: impl Into<PathBuf>) -> Self {
        Self::Archive {
            archive: archive.into(),
            extracted: None,
        }
    }

    /// Provide the files registered in the build context under `key`.
    pub fn reference(key: impl Into<String>) -> Self {
        Self::Ref {
            key: key.into(),
            resolved: None,
        }
    }

    /// Resolve the files.
    pub fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        match self {
            FilesProvider::Files(files) => {
                for file in files.iter() {
                    if !file.exists() {
                        bail!("File {} does not exist", file.display());
                    }
                }
            }
            FilesProvider::Archive { archive, extracted } => {
                if extracted.is_some() {
                    return Ok(());
                }
                if !archive.exists() {
                    bail!("Archive {} does not exist", archive.display());
                }
                let dir = ctx.temp_dir("archive-")?;
                let fakeroot = ctx.fakeroot(None)?;
                fakeroot.run(
                    "tar",
                    [
                        OsStr::new("-xpf"),
                        archive.as_os_str(),
                        OsStr::new("-C"),
                        dir.path().as_os_str(),
                    ],
                )?;
                let files = ProvidedFiles {
                    files: list_dir(dir.path())?,
                    fakeroot: Some(fakeroot),
                };
                *extracted = Some((dir, files));
            }
            FilesProvider::Ref { key, resolved } => {
                if resolved.is_none() {
                    *resolved = Some(ctx.resolve(key)?);
                }
            }
        }
        Ok(())
    }

    /// The resolved files.
    pub fn provided(&self) -> Result<ProvidedFiles> {
        match self {
            FilesProvider::Files(files) => Ok(ProvidedFiles {
                files: files.clone(),
                fakeroot: None,
            }),
            FilesProvider::Archive {
                extracted: Some((_, files)),
                ..
            }
            | FilesProvider::Ref {
                resolved: Some(files),
                ..
            } => Ok(files.clone()),
            _ => Err(Error::config(format!("files of {self} have not been resolved"))),
        }
    }
}

impl fmt::Display for FilesProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilesProvider::Files(files) => {
                f.write_str("files(")?;
                for (idx, file) in files.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", file.display())?;
                }
                f.write_str(")")
            }
            FilesProvider::Archive { archive, .. } => write!(f, "archive({})", archive.display()),
            FilesProvider::Ref { key, .. } => write!(f, "ref({key})"),
        }
    }
}

/// Sorted entries of a directory.
pub(crate) fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .context(format!("unable to read directory {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .context(format!("unable to read directory {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}
