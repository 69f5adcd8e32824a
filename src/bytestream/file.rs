//! Local-file [`ByteStream`] implementation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::bytestream::{ByteStream, Whence};
use crate::error::Result;

/// A [`ByteStream`] backed by a local `std::fs::File`.
///
/// No buffering is applied beyond what the OS provides; callers that read
/// in small increments should wrap reads at a higher layer (the
/// [`crate::pool`] buffer pool exists for exactly this).
#[derive(Debug)]
pub struct LocalFile {
    file: File,
    size: u64,
    pos: u64,
    eof: bool,
}

impl LocalFile {
    /// Opens `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            pos: 0,
            eof: size == 0,
        })
    }
}

impl ByteStream for LocalFile {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let n = self.file.read(dst)?;
        self.pos += n as u64;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let from = match whence {
            Whence::Start => SeekFrom::Start(offset.max(0) as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        let pos = self.file.seek(from)?;
        self.pos = pos;
        self.eof = pos >= self.size;
        Ok(pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn eof(&self) -> bool {
        self.eof
    }
}
