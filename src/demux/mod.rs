//! Demultiplexer family: one implementation per container, behind a common
//! interface.
//!
//! A demultiplexer owns the [`crate::bytestream::ByteStream`] it was opened
//! over, parses container metadata once, and then produces [`MediaChunk`]
//! values for an external decoder on demand.

pub mod flac;
pub mod io_ext;
pub mod iso;
pub mod ogg;
pub mod riff;
mod tag;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Coarse media kind of a [`StreamInfo`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodecType {
    Audio,
    Video,
    Subtitle,
}

/// Basic artist/title/album tag triple, populated where the container
/// format carries one (WAVE `LIST/INFO`, Vorbis comments, iTunes atoms).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tags {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
}

/// Per-elementary-stream descriptor, populated after `parse_container`.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Container-unique, nonzero.
    pub stream_id: u32,
    pub codec_type: CodecType,
    /// `"pcm"`, `"mp3"`, `"vorbis"`, `"opus"`, `"flac"`, `"aac"`, `"alac"`,
    /// `"alaw"`, `"mulaw"`, `"adpcm"`, ...
    pub codec_name: &'static str,
    /// Format-specific numeric identifier (WAVE format tag, ISO sample
    /// entry FourCC as `u32`, ...).
    pub codec_tag: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Nominal bitrate in bits/second, 0 if unknown.
    pub nominal_bitrate: u32,
    /// Codec-private configuration blob (WAVE `fmt ` extra data, Vorbis/Opus
    /// header packets, ISO `esds`/`alac`/`dOps` box payloads, ...).
    pub codec_private: Vec<u8>,
    pub total_samples: u64,
    pub duration_ms: u64,
    pub tags: Tags,
}

/// One encoded unit handed to a decoder. An empty `data` marks end-of-stream.
#[derive(Clone, Debug)]
pub struct MediaChunk {
    pub stream_id: u32,
    pub data: Vec<u8>,
    /// Format-native timestamp: sample count for RIFF/ISO/FLAC, granule
    /// position for Ogg.
    pub granule: u64,
    pub timestamp_ms: u64,
    /// Always `true` for the audio formats covered; reserved for future
    /// video support.
    pub keyframe: bool,
    /// Originating file offset, used for seek recovery.
    pub file_offset: u64,
}

impl MediaChunk {
    /// An empty chunk for `stream_id`, signalling end-of-stream.
    #[must_use]
    pub fn eof(stream_id: u32) -> Self {
        Self {
            stream_id,
            data: Vec::new(),
            granule: 0,
            timestamp_ms: 0,
            keyframe: true,
            file_offset: 0,
        }
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}

/// Counts of locally recovered standard violations, never individually
/// fatal (specification §7). Generalises the FLAC-specific recovery
/// bookkeeping to every container family.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Oversize/corrupted chunk or box sizes clamped to the remaining file.
    pub clamped_sizes: AtomicU64,
    /// Unrecognised chunk/box/page skipped by scanning forward.
    pub skipped_unknown: AtomicU64,
    /// CRC-8/CRC-16 failures (FLAC) or checksum mismatches (Ogg page CRC).
    pub checksum_failures: AtomicU64,
    /// Reserved-value or out-of-range field tolerated under a relaxed
    /// compliance level.
    pub reserved_value_tolerated: AtomicU64,
}

impl RecoveryStats {
    pub(crate) fn record_clamped_size(&self) {
        self.clamped_sizes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped_unknown(&self) {
        self.skipped_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reserved_value_tolerated(&self) {
        self.reserved_value_tolerated.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters, for a stats accessor or test assertion.
    #[must_use]
    pub fn snapshot(&self) -> RecoveryCounts {
        RecoveryCounts {
            clamped_sizes: self.clamped_sizes.load(Ordering::Relaxed),
            skipped_unknown: self.skipped_unknown.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            reserved_value_tolerated: self.reserved_value_tolerated.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`RecoveryStats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryCounts {
    pub clamped_sizes: u64,
    pub skipped_unknown: u64,
    pub checksum_failures: u64,
    pub reserved_value_tolerated: u64,
}

/// Common interface implemented by every container family.
///
/// A demultiplexer is parsed once, then driven by repeated `read_chunk`
/// calls, with `seek_to` available to reposition at any time after a
/// successful `parse_container`.
pub trait Demuxer {
    /// One-time header/index parse. Idempotent on repeated success; once it
    /// has failed, the instance is invalid and every other method returns
    /// a `Logic` error without further work.
    fn parse_container(&mut self) -> Result<()>;

    /// Enumerated streams, valid after a successful `parse_container`.
    fn streams(&self) -> &[StreamInfo];

    /// Looks up one stream by id.
    fn stream_info(&self, id: u32) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.stream_id == id)
    }

    /// Next chunk from any stream, in container order. An empty chunk means
    /// end-of-stream.
    fn read_chunk(&mut self) -> Result<MediaChunk>;

    /// Next chunk belonging to stream `id` specifically.
    fn read_chunk_for(&mut self, id: u32) -> Result<MediaChunk>;

    /// Repositions so the next `read_chunk` returns data at-or-before `ms`.
    /// Falls back to the start of the file when sample-accurate seeking is
    /// not possible (e.g. a compressed stream with no usable index).
    fn seek_to(&mut self, ms: u64) -> Result<()>;

    fn eof(&self) -> bool;
    fn duration_ms(&self) -> u64;
    fn position_ms(&self) -> u64;

    /// Ogg granule position for `id`; `0` for non-Ogg formats.
    fn granule_position(&self, _id: u32) -> u64 {
        0
    }

    /// Locally recovered standard-violation counters accumulated so far.
    fn recovery_stats(&self) -> &RecoveryStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_chunk_has_empty_payload() {
        let chunk = MediaChunk::eof(1);
        assert!(chunk.is_eof());
    }

    #[test]
    fn recovery_stats_snapshot_reflects_recordings() {
        let stats = RecoveryStats::default();
        stats.record_clamped_size();
        stats.record_skipped_unknown();
        stats.record_skipped_unknown();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.clamped_sizes, 1);
        assert_eq!(snapshot.skipped_unknown, 2);
    }
}
