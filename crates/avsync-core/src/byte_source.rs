//! Read-only byte streams that containers are opened over.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Random-access, read-only byte stream.
pub trait ByteSource: Send {
    /// Reads up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the cursor; returns the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Total length in bytes, if known.
    fn size(&mut self) -> io::Result<u64>;
}

/// A [`ByteSource`] over a file on disk.
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        tracing::debug!("Opened {} ({len} bytes)", path.as_ref().display());
        Ok(Self { file, len })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.len)
    }
}

/// A [`ByteSource`] over an owned buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    position: u64,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => len + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}
