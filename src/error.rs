//! Error handling for the demultiplexing core.
//!
//! Provides a unified error type based on the taxonomy in the specification:
//! I/O, Format, Standard-violation, Resource and Logic errors. Standard
//! violations are never surfaced as fatal on their own — they are recorded by
//! callers through [`crate::demux::RecoveryStats`] and only escalate to a
//! `Format` or `Logic` error when the demuxer genuinely cannot continue.
//!
//! # Examples
//!
//! ```rust
//! use demux_core::error::{Error, ErrorKind, Result};
//!
//! fn parse_header() -> Result<()> {
//!     Err(Error::format("missing 'fmt ' chunk"))
//! }
//! ```

use std::fmt;

use thiserror::Error;

/// Classification of an error, per the specification's error taxonomy (§7).
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum ErrorKind {
    /// Read/seek/HTTP failure. Transient HTTP errors are recovered locally by
    /// retry; only errors that survive retry are surfaced with this kind.
    #[error("I/O error")]
    Io,

    /// Structural container violation the demuxer cannot work around (no
    /// `fmt ` chunk, absent `moov`, missing `STREAMINFO`, ...).
    #[error("format error")]
    Format,

    /// Deviation from the container's own spec that is individually
    /// recoverable (oversize chunk, reserved value, unexpected nesting).
    /// Never fatal alone; see [`crate::demux::RecoveryStats`].
    #[error("standard violation")]
    StandardViolation,

    /// Allocation failure or an exceeded resource cap (buffer pool ceiling,
    /// frame index memory cap, box-nesting cap, ...).
    #[error("resource exhausted")]
    Resource,

    /// Internal invariant broken (inconsistent sample tables, ...). Never
    /// retried.
    #[error("internal logic error")]
    Logic,
}

/// A byte or sample position at which an error was observed, for diagnostics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Position {
    /// Absolute byte offset in the container, if known.
    pub byte_offset: Option<u64>,
    /// Sample offset within the primary stream, if known.
    pub sample_offset: Option<u64>,
}

impl Position {
    /// A position carrying only a byte offset.
    #[must_use]
    pub fn at_byte(offset: u64) -> Self {
        Self {
            byte_offset: Some(offset),
            sample_offset: None,
        }
    }

    /// A position carrying only a sample offset.
    #[must_use]
    pub fn at_sample(offset: u64) -> Self {
        Self {
            byte_offset: None,
            sample_offset: Some(offset),
        }
    }
}

/// The crate's unified error type.
///
/// Carries a [`ErrorKind`], a human-readable message, an optional [`Position`]
/// and an optional underlying source error.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error.
    pub kind: ErrorKind,
    /// Human-readable message. Short machine identifier plus context.
    pub message: String,
    /// Position at which the error was observed, if known.
    pub position: Option<Position>,
    /// Underlying error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Standard result type for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
            source: None,
        }
    }

    /// Attaches a position to this error.
    #[must_use]
    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Attaches an underlying source error.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Constructs an [`ErrorKind::Io`] error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Constructs an [`ErrorKind::Format`] error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    /// Constructs an [`ErrorKind::StandardViolation`] error.
    ///
    /// Most call sites should prefer recording the event on
    /// [`crate::demux::RecoveryStats`] and continuing; use this constructor
    /// only when the violation could not be locally recovered after all.
    pub fn standard_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StandardViolation, message)
    }

    /// Constructs an [`ErrorKind::Resource`] error.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    /// Constructs an [`ErrorKind::Logic`] error.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, message)
    }

    /// `true` if this is an I/O error whose cause is plausibly transient
    /// (short reads racing a slow network, interrupted syscalls). Used by
    /// demuxers deciding whether to retry a read at the byte-stream layer
    /// before counting it as a hard failure.
    #[must_use]
    pub fn is_io(&self) -> bool {
        self.kind == ErrorKind::Io
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(pos) = &self.position {
            if let Some(b) = pos.byte_offset {
                write!(f, " (at byte {b})")?;
            }
            if let Some(s) = pos.sample_offset {
                write!(f, " (at sample {s})")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string()).with_source(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::io(e.to_string()).with_source(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_position() {
        let err = Error::format("missing fmt chunk").at(Position::at_byte(42));
        let rendered = err.to_string();
        assert!(rendered.contains("format error"));
        assert!(rendered.contains("42"));
    }

    #[test]
    fn io_conversion_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
