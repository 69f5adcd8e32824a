//! Fixed-width and string readers shared by every demultiplexer.
//!
//! Grounded in the `ReadBytes`-style helper traits of container-parsing
//! crates: every read either succeeds with exactly the requested bytes or
//! fails, so parsers never have to special-case short reads themselves.

use crate::bytestream::ByteStream;
use crate::error::{Error, Result};

/// Endian-aware fixed-width and string readers over any [`ByteStream`].
pub trait ReadExt: ByteStream {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_i16_le(&mut self) -> Result<i16> {
        Ok(self.read_u16_le()? as i16)
    }

    fn read_i32_le(&mut self) -> Result<i32> {
        Ok(self.read_u32_le()? as i32)
    }

    /// Reads a four-character code (ISO box type, RIFF/AIFF chunk id) as raw
    /// bytes, without requiring valid UTF-8.
    fn read_fourcc(&mut self) -> Result<[u8; 4]> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads exactly `len` bytes as an ASCII/Latin-1 string, replacing
    /// invalid bytes with `'\u{FFFD}'` rather than failing; tag metadata in
    /// the wild is not always clean ASCII.
    fn read_fixed_string(&mut self, len: usize) -> Result<String> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads a null-terminated string, capped at `max_len` bytes (inclusive
    /// of the terminator) to bound runaway reads over corrupt input.
    fn read_cstring(&mut self, max_len: usize) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            if bytes.len() >= max_len {
                return Err(Error::format("null-terminated string exceeds safety cap"));
            }
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Skips forward to the next `align`-byte boundary (`align` ∈ {2, 4, 8}).
    fn align_to(&mut self, align: u64) -> Result<()> {
        let pos = self.tell();
        let remainder = pos % align;
        if remainder != 0 {
            let pad = align - remainder;
            self.seek(pad as i64, crate::bytestream::Whence::Current)?;
        }
        Ok(())
    }
}

impl<T: ByteStream + ?Sized> ReadExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    #[test]
    fn reads_little_and_big_endian() {
        let mut stream = MemoryStream::new(vec![0x01, 0x00, 0x00, 0x01]);
        assert_eq!(stream.read_u16_le().unwrap(), 1);
        assert_eq!(stream.read_u16_be().unwrap(), 1);
    }

    #[test]
    fn cstring_respects_cap() {
        let mut stream = MemoryStream::new(vec![b'a'; 16]);
        assert!(stream.read_cstring(4).is_err());
    }

    #[test]
    fn align_to_skips_padding() {
        let mut stream = MemoryStream::new(vec![0u8; 8]);
        stream.seek(3, crate::bytestream::Whence::Start).unwrap();
        stream.align_to(4).unwrap();
        assert_eq!(stream.tell(), 4);
    }
}
