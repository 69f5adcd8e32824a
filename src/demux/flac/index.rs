//! Three-tier seek resolution: a lazily-built frame index, the embedded
//! `SEEKTABLE`, and linear-from-zero as the last resort.
//!
//! Binary-searching blindly over raw file bytes (guessing an offset, probing
//! for a valid frame, bisecting) is not attempted here: FLAC frames carry no
//! declared length, so an unindexed bisection has no way to recognise
//! "closer" without first finding a valid sync, and is prone to false
//! positives in compressed audio data. Bisecting the in-memory index below
//! is a different thing entirely and is exactly what [`resolve_seek_offset`]
//! does.

use crate::demux::flac::metadata::SeekPoint;

pub(super) const MAX_INDEX_ENTRIES: usize = 50_000;
pub(super) const MIN_INDEX_SPACING_MS: i64 = 1_000;

/// One entry of the sample-offset frame index, built once during
/// `parse_container` by walking every frame header in the file.
#[derive(Clone, Copy, Debug)]
pub(super) struct FrameIndexEntry {
    pub sample: u64,
    pub offset: u64,
}

/// Resolves `target_sample` to the best byte offset to seek to: the last
/// frame index entry at or before it, falling back to the embedded
/// `SEEKTABLE`, falling back to the first frame.
pub(super) fn resolve_seek_offset(
    frame_index: &[FrameIndexEntry],
    seektable: &[SeekPoint],
    first_frame_offset: u64,
    target_sample: u64,
) -> u64 {
    if !frame_index.is_empty() {
        let idx = frame_index.partition_point(|e| e.sample <= target_sample);
        if idx > 0 {
            return frame_index[idx - 1].offset;
        }
    }
    if !seektable.is_empty() {
        let idx = seektable.partition_point(|p| p.sample_number <= target_sample);
        if idx > 0 {
            return first_frame_offset + seektable[idx - 1].stream_offset;
        }
    }
    first_frame_offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_frame_index_over_seektable() {
        let index = vec![
            FrameIndexEntry { sample: 0, offset: 100 },
            FrameIndexEntry { sample: 44_100, offset: 5_000 },
        ];
        let offset = resolve_seek_offset(&index, &[], 100, 50_000);
        assert_eq!(offset, 5_000);
    }

    #[test]
    fn falls_back_to_seektable_when_index_empty() {
        let table = vec![SeekPoint { sample_number: 0, stream_offset: 0, frame_samples: 4096 }];
        let offset = resolve_seek_offset(&[], &table, 1_000, 10);
        assert_eq!(offset, 1_000);
    }

    #[test]
    fn falls_back_to_first_frame_when_nothing_indexed() {
        let offset = resolve_seek_offset(&[], &[], 500, 10);
        assert_eq!(offset, 500);
    }
}
