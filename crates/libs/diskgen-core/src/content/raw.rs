use std::fmt;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use super::ContentType;
use crate::context::BuildContext;
use crate::fsutils::{copy_sparse, Sink};
use crate::size::SizeType;
use crate::{bail, IoContext, Result};

/// Zero-filled content.
#[derive(Debug, Default)]
pub struct EmptyContent {
    size: SizeType,
}

impl EmptyContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(size: SizeType) -> Self {
        Self { size }
    }
}

impl ContentType for EmptyContent {
    fn size(&self) -> SizeType {
        self.size
    }

    fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    fn prepare(&mut self, _: &mut BuildContext) -> Result<()> {
        if self.size.is_undefined() {
            bail!("Size for empty content must be defined");
        }
        Ok(())
    }

    fn write(&mut self, _: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        sink.write_zeros(self.size.bytes()?)
            .and_then(|_| sink.finish())
            .context("unable to write zeros")
    }
}

impl fmt::Display for EmptyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Empty")
    }
}

/// Bytes of a file, starting at an offset.
///
/// Without an explicit size, the content spans everything after the offset.
#[derive(Debug)]
pub struct RawContent {
    file: PathBuf,
    offset: u64,
    size: SizeType,
}

impl RawContent {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            offset: 0,
            size: SizeType::UNDEFINED,
        }
    }

    /// Skip the first `offset` bytes of the file.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

impl ContentType for RawContent {
    fn size(&self) -> SizeType {
        self.size
    }

    fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    fn prepare(&mut self, _: &mut BuildContext) -> Result<()> {
        if !self.file.exists() {
            bail!("File {} does not exist", self.file.display());
        }
        let len = self
            .file
            .metadata()
            .context(format!("unable to read metadata of {}", self.file.display()))?
            .len();
        let Some(available) = len.checked_sub(self.offset) else {
            bail!(
                "Offset {} is beyond the end of {} ({len} B)",
                self.offset,
                self.file.display()
            );
        };
        match self.size.get() {
            None => self.size = SizeType::new(available),
            Some(size) if size > available => {
                bail!("Trying to copy {size} B, but the file has only {available} B left");
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn write(&mut self, _: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        let mut file = File::open(&self.file)
            .context(format!("unable to open {}", self.file.display()))?;
        file.seek(SeekFrom::Start(self.offset))
            .context(format!("unable to seek in {}", self.file.display()))?;
        copy_sparse(sink, &mut file, self.size.bytes()?)
            .context(format!("unable to copy {}", self.file.display()))
    }
}

impl fmt::Display for RawContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Raw({})", self.file.display())?;
        if self.offset > 0 {
            write!(f, " at offset {}", self.offset)?;
        }
        Ok(())
    }
}
