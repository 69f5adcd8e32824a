//! Uniform seekable random-access byte source.
//!
//! [`ByteStream`] is the capability every demultiplexer is written against.
//! Local files and HTTP range-request servers both honour the same contract,
//! so the demultiplexer layer never has to know which one it was handed.
//!
//! # Examples
//!
//! ```no_run
//! use demux_core::bytestream::{ByteStream, LocalFile, Whence};
//!
//! let mut file = LocalFile::open("track.flac")?;
//! let mut header = [0u8; 4];
//! file.read(&mut header)?;
//! file.seek(0, Whence::Start)?;
//! # Ok::<(), demux_core::error::Error>(())
//! ```

pub mod file;
pub mod http;
pub mod memory;

pub use file::LocalFile;
pub use http::HttpStream;
pub use memory::MemoryStream;

use crate::error::Result;

/// Origin for a [`ByteStream::seek`] offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    /// Offset from the beginning of the stream.
    Start,
    /// Offset from the current position (may be negative).
    Current,
    /// Offset from the end of the stream. Fails if the stream's size is
    /// unknown.
    End,
}

/// A seekable byte source with integer positions in `[0, size]`.
///
/// Implementations serialise operations per instance: a single `ByteStream`
/// is not meant to be driven concurrently from multiple threads (see the
/// crate's concurrency model), but two different instances may be used in
/// parallel.
///
/// # Invariants
///
/// - After a successful `read` of `n` bytes, `tell()` has advanced by
///   exactly `n`.
/// - `seek` beyond `size()` (when known) is an error.
/// - `seek(_, Whence::End)` fails cleanly when `size()` is unknown (e.g. a
///   live HTTP stream without `Content-Length`).
pub trait ByteStream: Send {
    /// Reads up to `dst.len()` bytes, returning the number actually read
    /// (`0..=dst.len()`). A return of `0` with `eof()` false indicates a
    /// transient short read (e.g. network) — callers should retry after
    /// advancing nothing.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// Repositions the stream. Returns the absolute position after seeking.
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64>;

    /// Returns the current absolute byte position.
    fn tell(&self) -> u64;

    /// Returns the total size in bytes, if known.
    fn size(&self) -> Option<u64>;

    /// `true` once a read has confirmed there is no more data to deliver.
    fn eof(&self) -> bool;

    /// The last error observed by this stream, if any is cached for
    /// diagnostics. Streams are not required to retain this; `None` does
    /// not imply no error has ever occurred.
    fn last_error(&self) -> Option<&crate::error::Error> {
        None
    }

    /// Reads exactly `dst.len()` bytes, looping over short reads, and fails
    /// if EOF is reached before the buffer is full.
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read(&mut dst[filled..])?;
            if n == 0 {
                if self.eof() {
                    return Err(crate::error::Error::io(format!(
                        "unexpected end of stream: wanted {} more byte(s)",
                        dst.len() - filled
                    )));
                }
                // Transient short read (e.g. network); keep trying.
                continue;
            }
            filled += n;
        }
        Ok(())
    }
}
