//! Utilities for working with the filesystem.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Block size used for sparse copying.
pub const SPARSE_BLOCK_SIZE: usize = 4096;

/// Create a file of the given size without allocating any blocks.
///
/// An existing file is truncated.
pub fn allocate_file(path: &Path, size: u64) -> io::Result<File> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

/// Deallocate the given byte range of a file without changing its size.
///
/// Returns `false` if the filesystem does not support punching holes.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, offset: u64, size: u64) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    use nix::errno::Errno;
    use nix::fcntl::FallocateFlags;

    let offset = i64::try_from(offset).map_err(io::Error::other)?;
    let size = i64::try_from(size).map_err(io::Error::other)?;
    match nix::fcntl::fallocate(
        file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        offset,
        size,
    ) {
        Ok(()) => Ok(true),
        Err(Errno::EOPNOTSUPP) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// Deallocate the given byte range of a file without changing its size.
#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_file: &File, _offset: u64, _size: u64) -> io::Result<bool> {
    Ok(false)
}

/// Destination of content which may skip over zeros.
pub trait Sink: Write {
    /// Write `len` zero bytes.
    ///
    /// Implementations may produce a hole instead of writing the zeros.
    fn write_zeros(&mut self, len: u64) -> io::Result<()> {
        let zeros = [0; SPARSE_BLOCK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(SPARSE_BLOCK_SIZE as u64) as usize;
            self.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Make sure all skipped bytes are materialized.
    fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Sink for Vec<u8> {
    fn write_zeros(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        self.resize(self.len() + len, 0);
        Ok(())
    }
}

impl Sink for File {
    fn write_zeros(&mut self, len: u64) -> io::Result<()> {
        let position = self.stream_position()?;
        // Bytes past the end of the file are zero already.
        let existing = self.metadata()?.len().saturating_sub(position).min(len);
        if existing > 0 && !punch_hole(self, position, existing)? {
            write_zeros_slow(self, existing)?;
        }
        self.seek(SeekFrom::Start(position + len))?;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        // Seeking past the end does not extend the file, fix up the trailing hole.
        let position = self.stream_position()?;
        if position > self.metadata()?.len() {
            self.seek(SeekFrom::Start(position - 1))?;
            self.write_all(b"\0")?;
            self.set_len(position)?;
        }
        self.flush()
    }
}

fn write_zeros_slow(writer: &mut impl Write, len: u64) -> io::Result<()> {
    io::copy(&mut io::repeat(0).take(len), writer)?;
    Ok(())
}

/// Copy `size` bytes from `src` to `dst`, skipping blocks of zeros.
///
/// Fails if `src` has less than `size` bytes left.
pub fn copy_sparse<R, S>(dst: &mut S, src: &mut R, size: u64) -> io::Result<()>
where
    R: Read + ?Sized,
    S: Sink + ?Sized,
{
    let mut buffer = vec![0; SPARSE_BLOCK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(SPARSE_BLOCK_SIZE as u64) as usize;
        let read = read_full(src, &mut buffer[..chunk])?;
        if read < chunk {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Trying to copy {size} B, but the file has only {} B left",
                    size - remaining + read as u64
                ),
            ));
        }
        if chunk == SPARSE_BLOCK_SIZE && buffer.iter().all(|byte| *byte == 0) {
            dst.write_zeros(chunk as u64)?;
        } else {
            dst.write_all(&buffer[..chunk])?;
        }
        remaining -= chunk as u64;
    }
    dst.finish()
}

/// Read until the buffer is full or the reader is exhausted.
fn read_full<R: Read + ?Sized>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}
