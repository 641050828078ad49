use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use tracing::info;
use xscript::{Cmd, ParentEnv, Run};

use super::{ContentType, FilesProvider, ResultFile};
use crate::context::BuildContext;
use crate::fsutils::{allocate_file, Sink};
use crate::size::SizeType;
use crate::{bail, Error, IoContext, Result};

/// Run an external tool outside of `fakeroot`.
fn run_tool<I, A>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut cmd: Cmd<std::ffi::OsString> = Cmd::new(program);
    for arg in args {
        cmd.add_arg(arg);
    }
    ParentEnv
        .run(cmd.with_stdout(xscript::Out::Capture))
        .map_err(|error| Error::tool(format!("{program} failed"), error))?;
    Ok(())
}

fn describe_files(f: &mut fmt::Formatter<'_>, files: &Option<FilesProvider>) -> fmt::Result {
    match files {
        Some(files) => write!(f, " with {files}"),
        None => Ok(()),
    }
}

/// Ext4 filesystem populated from files.
#[derive(Debug, Default)]
pub struct Ext4Content {
    size: SizeType,
    files: Option<FilesProvider>,
    result: ResultFile,
}

impl Ext4Content {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the filesystem with the given files.
    pub fn with_files(mut self, files: FilesProvider) -> Self {
        self.files = Some(files);
        self
    }
}

fn produce_ext4(
    ctx: &BuildContext,
    files: Option<&FilesProvider>,
    size: SizeType,
    image: &Path,
) -> Result<()> {
    allocate_file(image, size.bytes()?).context("unable to allocate ext4 image")?;
    info!("Creating ext4 filesystem ({size})");
    let Some(files) = files else {
        return run_tool("mkfs.ext4", [image.as_os_str()]);
    };
    let provided = files.provided()?;
    let root = ctx.temp_dir("ext4-root-")?;
    let fakeroot = ctx.fakeroot(provided.fakeroot.as_ref())?;
    for file in &provided.files {
        fakeroot.copy(file, root.path())?;
    }
    fakeroot.run(
        "mkfs.ext4",
        [OsStr::new("-d"), root.path().as_os_str(), image.as_os_str()],
    )
}

impl ContentType for Ext4Content {
    fn size(&self) -> SizeType {
        self.size
    }

    fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if self.size.is_undefined() {
            bail!("Ext4 content requires a fixed size at the moment");
        }
        if let Some(files) = &mut self.files {
            files.prepare(ctx)?;
        }
        Ok(())
    }

    fn write(&mut self, ctx: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        let files = self.files.as_ref();
        let size = self.size;
        self.result.write(ctx, ".ext4", size, sink, |path| {
            produce_ext4(ctx, files, size, path)
        })
    }
}

impl fmt::Display for Ext4Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ext4")?;
        describe_files(f, &self.files)
    }
}

/// FAT32 filesystem populated from files.
#[derive(Debug, Default)]
pub struct Fat32Content {
    size: SizeType,
    files: Option<FilesProvider>,
    result: ResultFile,
}

impl Fat32Content {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the filesystem with the given files.
    pub fn with_files(mut self, files: FilesProvider) -> Self {
        self.files = Some(files);
        self
    }
}

fn produce_fat32(files: Option<&FilesProvider>, size: SizeType, image: &Path) -> Result<()> {
    allocate_file(image, size.bytes()?).context("unable to allocate FAT32 image")?;
    info!("Creating FAT32 filesystem ({size})");
    run_tool("mkfs.vfat", [image.as_os_str()])?;
    let Some(files) = files else {
        return Ok(());
    };
    let provided = files.provided()?;
    for file in &provided.files {
        let args = [
            OsStr::new("-i"),
            image.as_os_str(),
            OsStr::new("-snop"),
            file.as_os_str(),
            OsStr::new("::"),
        ];
        match &provided.fakeroot {
            Some(fakeroot) => fakeroot.run("mcopy", args)?,
            None => run_tool("mcopy", args)?,
        }
    }
    Ok(())
}

impl ContentType for Fat32Content {
    fn size(&self) -> SizeType {
        self.size
    }

    fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    fn prepare(&mut self, ctx: &mut BuildContext) -> Result<()> {
        if self.size.is_undefined() {
            bail!("FAT32 content requires a fixed size at the moment");
        }
        if let Some(files) = &mut self.files {
            files.prepare(ctx)?;
        }
        Ok(())
    }

    fn write(&mut self, ctx: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        let files = self.files.as_ref();
        let size = self.size;
        self.result
            .write(ctx, ".vfat", size, sink, |path| produce_fat32(files, size, path))
    }
}

impl fmt::Display for Fat32Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fat32")?;
        describe_files(f, &self.files)
    }
}
