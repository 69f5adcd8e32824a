//! In-memory [`ByteStream`] implementation, used by tests and by callers
//! that have already materialized a container in memory.

use crate::bytestream::{ByteStream, Whence};
use crate::error::{Error, Result};

/// A [`ByteStream`] backed by an in-memory `Vec<u8>`.
///
/// Size is always known; seeking from the end always succeeds.
#[derive(Clone, Debug)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: u64,
    eof: bool,
}

impl MemoryStream {
    /// Wraps `data` as a byte stream, positioned at offset 0.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            eof: false,
        }
    }
}

impl ByteStream for MemoryStream {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let pos = self.pos as usize;
        if pos >= self.data.len() {
            self.eof = true;
            return Ok(0);
        }
        let n = dst.len().min(self.data.len() - pos);
        dst[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.pos += n as u64;
        if self.pos as usize >= self.data.len() {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos as i64,
            Whence::End => self.data.len() as i64,
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| Error::io("seek offset overflow"))?;
        if target < 0 || target as u64 > self.data.len() as u64 {
            return Err(Error::io(format!(
                "seek to {target} out of bounds (size {})",
                self.data.len()
            )));
        }
        self.pos = target as u64;
        self.eof = self.pos as usize >= self.data.len();
        Ok(self.pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances_position_exactly() {
        let mut stream = MemoryStream::new(vec![0, 1, 2, 3, 4, 5, 6, 7]);
        let mut buf = [0u8; 3];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(stream.tell(), 3);
    }

    #[test]
    fn seek_past_end_is_error() {
        let mut stream = MemoryStream::new(vec![0, 1, 2]);
        assert!(stream.seek(10, Whence::Start).is_err());
    }

    #[test]
    fn seek_from_end_with_known_size_succeeds() {
        let mut stream = MemoryStream::new(vec![0, 1, 2, 3]);
        let pos = stream.seek(-1, Whence::End).unwrap();
        assert_eq!(pos, 3);
    }

    #[test]
    fn eof_set_after_short_read_at_end() {
        let mut stream = MemoryStream::new(vec![0, 1]);
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert!(!stream.eof());
        let n2 = stream.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
        assert!(stream.eof());
    }
}
