//! Fragmented-file support: `moof`/`traf`/`trun`, with the `tfhd` defaults
//! cascade (track fragment → movie header) and out-of-order fragment
//! reassembly keyed by sequence number.

use std::collections::BTreeMap;

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::iso::boxes::{read_box_header, BoxHeader};
use crate::demux::RecoveryStats;
use crate::error::Result;

const TFHD_BASE_DATA_OFFSET_PRESENT: u32 = 0x0000_01;
const TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x0000_02;
const TFHD_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x0000_08;
const TFHD_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x0000_10;
const TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_20;

const TRUN_DATA_OFFSET_PRESENT: u32 = 0x00_0001;
const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x00_0004;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x00_0100;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x00_0200;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x00_0400;
const TRUN_SAMPLE_COMPOSITION_OFFSET_PRESENT: u32 = 0x00_0800;

/// One sample described by a `trun` entry, with `tfhd`/movie-header
/// defaults already resolved.
#[derive(Clone, Copy, Debug)]
pub(super) struct FragmentSample {
    pub offset: u64,
    pub size: u64,
    pub duration: u32,
}

/// One track's samples within a single `moof`, in order.
#[derive(Clone, Debug, Default)]
pub(super) struct TrackFragment {
    pub track_id: u32,
    pub samples: Vec<FragmentSample>,
}

/// Defaults a `tfhd` may override, themselves defaulting to the movie
/// header's `trex` entry (not modelled separately here; this demultiplexer
/// treats an absent default as "must be supplied per-sample").
#[derive(Clone, Copy, Debug, Default)]
struct TrackFragmentDefaults {
    sample_description_index: u32,
    default_sample_duration: u32,
    default_sample_size: u32,
}

/// Parses one `moof` box's payload (already positioned just past its
/// header) into per-track sample runs. `moof_start` is the absolute offset
/// of the `moof` box itself, the default base for `trun` data offsets.
pub(super) fn parse_moof(
    stream: &mut dyn ByteStream,
    moof_start: u64,
    moof_end: u64,
    recovery: &RecoveryStats,
) -> Result<(u32, Vec<TrackFragment>)> {
    let mut sequence_number = 0u32;
    let mut tracks = Vec::new();

    while stream.tell() + 8 <= moof_end {
        let header = match read_box_header(stream, moof_end, recovery) {
            Ok(h) => h,
            Err(_) => break,
        };
        if header.is(b"mfhd") {
            let _version_flags = stream.read_u32_be()?;
            sequence_number = stream.read_u32_be()?;
        } else if header.is(b"traf") {
            if let Some(track) = parse_traf(stream, moof_start, header.end(), recovery)? {
                tracks.push(track);
            }
        }
        stream.seek(header.end() as i64, Whence::Start)?;
    }
    Ok((sequence_number, tracks))
}

fn parse_traf(
    stream: &mut dyn ByteStream,
    moof_start: u64,
    traf_end: u64,
    recovery: &RecoveryStats,
) -> Result<Option<TrackFragment>> {
    let mut track_id = 0u32;
    let mut defaults = TrackFragmentDefaults::default();
    let mut base_data_offset = moof_start;
    let mut samples = Vec::new();

    while stream.tell() + 8 <= traf_end {
        let header = match read_box_header(stream, traf_end, recovery) {
            Ok(h) => h,
            Err(_) => break,
        };
        if header.is(b"tfhd") {
            let (id, base) = parse_tfhd(stream, moof_start, &mut defaults)?;
            track_id = id;
            base_data_offset = base;
        } else if header.is(b"trun") {
            let run = parse_trun(stream, base_data_offset, &defaults)?;
            samples.extend(run);
        }
        stream.seek(header.end() as i64, Whence::Start)?;
    }

    if track_id == 0 {
        return Ok(None);
    }
    Ok(Some(TrackFragment { track_id, samples }))
}

fn parse_tfhd(stream: &mut dyn ByteStream, moof_start: u64, defaults: &mut TrackFragmentDefaults) -> Result<(u32, u64)> {
    let version_flags = stream.read_u32_be()?;
    let flags = version_flags & 0x00FF_FFFF;
    let track_id = stream.read_u32_be()?;

    let mut base_data_offset = moof_start;
    if flags & TFHD_BASE_DATA_OFFSET_PRESENT != 0 {
        base_data_offset = stream.read_u64_be()?;
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT != 0 {
        defaults.sample_description_index = stream.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_DURATION_PRESENT != 0 {
        defaults.default_sample_duration = stream.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_SIZE_PRESENT != 0 {
        defaults.default_sample_size = stream.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT != 0 {
        let _default_sample_flags = stream.read_u32_be()?;
    }
    Ok((track_id, base_data_offset))
}

fn parse_trun(stream: &mut dyn ByteStream, base_data_offset: u64, defaults: &TrackFragmentDefaults) -> Result<Vec<FragmentSample>> {
    let version_flags = stream.read_u32_be()?;
    let flags = version_flags & 0x00FF_FFFF;
    let sample_count = stream.read_u32_be()?;

    let mut data_offset = base_data_offset;
    if flags & TRUN_DATA_OFFSET_PRESENT != 0 {
        data_offset = (base_data_offset as i64 + i64::from(stream.read_u32_be()? as i32)) as u64;
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0 {
        let _first_sample_flags = stream.read_u32_be()?;
    }

    let mut samples = Vec::with_capacity(sample_count as usize);
    let mut offset = data_offset;
    for _ in 0..sample_count {
        let duration = if flags & TRUN_SAMPLE_DURATION_PRESENT != 0 {
            stream.read_u32_be()?
        } else {
            defaults.default_sample_duration
        };
        let size = if flags & TRUN_SAMPLE_SIZE_PRESENT != 0 {
            stream.read_u32_be()?
        } else {
            defaults.default_sample_size
        };
        if flags & TRUN_SAMPLE_FLAGS_PRESENT != 0 {
            let _sample_flags = stream.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_COMPOSITION_OFFSET_PRESENT != 0 {
            let _composition_offset = stream.read_u32_be()?;
        }
        samples.push(FragmentSample { offset, size: u64::from(size), duration });
        offset += u64::from(size);
    }
    Ok(samples)
}

/// Accumulates parsed `moof` fragments keyed by sequence number so that
/// fragments discovered out of order (or from a `mfra` fragment-random-
/// access index) still flatten into presentation order.
#[derive(Debug, Default)]
pub(super) struct FragmentIndex {
    fragments: BTreeMap<u32, Vec<TrackFragment>>,
}

impl FragmentIndex {
    pub(super) fn insert(&mut self, sequence_number: u32, tracks: Vec<TrackFragment>) {
        self.fragments.insert(sequence_number, tracks);
    }

    /// Flattens every fragment's samples for `track_id`, in sequence-number
    /// order, into one contiguous run.
    pub(super) fn flatten_track(&self, track_id: u32) -> Vec<FragmentSample> {
        self.fragments
            .values()
            .flat_map(|tracks| tracks.iter().filter(|t| t.track_id == track_id))
            .flat_map(|t| t.samples.iter().copied())
            .collect()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_track_orders_by_sequence_number_not_insertion_order() {
        let mut index = FragmentIndex::default();
        index.insert(2, vec![TrackFragment {
            track_id: 1,
            samples: vec![FragmentSample { offset: 200, size: 10, duration: 1024 }],
        }]);
        index.insert(1, vec![TrackFragment {
            track_id: 1,
            samples: vec![FragmentSample { offset: 100, size: 10, duration: 1024 }],
        }]);
        let samples = index.flatten_track(1);
        assert_eq!(samples[0].offset, 100);
        assert_eq!(samples[1].offset, 200);
    }
}
