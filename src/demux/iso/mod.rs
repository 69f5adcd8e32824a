//! ISO Base Media File Format demultiplexer (ISO/IEC 14496-12): MP4/M4A/MOV.
//!
//! Recursive-descent box walk of `moov`'s track hierarchy and (for
//! fragmented files) the `moof`/`traf`/`trun` sequence, feeding a uniform
//! per-track sample plan that both paths resolve to identically.

mod boxes;
mod compliance;
mod fragment;
mod sample_table;
mod tags;

use crate::bytestream::{ByteStream, Whence};
use crate::config::IsoConfig;
use crate::demux::io_ext::ReadExt;
use crate::demux::iso::boxes::read_box_header;
use crate::demux::iso::compliance::ComplianceTracker;
use crate::demux::iso::fragment::FragmentIndex;
use crate::demux::iso::sample_table::{SampleEntry, SampleTable};
use crate::demux::{CodecType, Demuxer, MediaChunk, RecoveryStats, StreamInfo, Tags};
use crate::error::{Error, Result};

pub use compliance::Verdict as ComplianceVerdict;

const MAX_BOXES_PER_CONTAINER: u32 = 10_000;

/// One sample fully resolved to a file offset, byte size and duration,
/// whether it came from `stbl` or a `moof`/`trun` fragment.
struct PlannedSample {
    offset: u64,
    size: u64,
    duration: u32,
}

struct Track {
    track_id: u32,
    handler_type: [u8; 4],
    timescale: u32,
    sample_entry: Option<SampleEntry>,
    sample_table: SampleTable,
    planned: Vec<PlannedSample>,
    position: usize,
}

impl Track {
    fn is_audio(&self) -> bool {
        &self.handler_type == b"soun"
    }

    fn timestamp_ms(&self, sample_index: usize) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        self.sample_table.sample_time(sample_index) * 1000 / u64::from(self.timescale)
    }
}

/// Demultiplexer for ISO Base Media (MP4/M4A/MOV/3GP) containers.
pub struct IsoDemuxer {
    stream: Box<dyn ByteStream>,
    config: IsoConfig,
    file_size: u64,
    tracks: Vec<Track>,
    stream_infos: Vec<StreamInfo>,
    tags: Tags,
    fragments: FragmentIndex,
    compliance: ComplianceTracker,
    recovery: RecoveryStats,
    parsed: bool,
}

impl IsoDemuxer {
    #[must_use]
    pub fn new(stream: Box<dyn ByteStream>, config: IsoConfig) -> Self {
        Self {
            stream,
            config,
            file_size: 0,
            tracks: Vec::new(),
            stream_infos: Vec::new(),
            tags: Tags::default(),
            fragments: FragmentIndex::default(),
            compliance: ComplianceTracker::new(config.compliance_level),
            recovery: RecoveryStats::default(),
            parsed: false,
        }
    }

    /// Overall ISO/IEC 14496-12 compliance verdict accumulated while
    /// parsing, per the configured [`crate::config::ComplianceLevel`].
    #[must_use]
    pub fn compliance(&self) -> ComplianceVerdict {
        self.compliance.verdict()
    }

    fn walk_top_level(&mut self) -> Result<()> {
        self.file_size = self.stream.size().unwrap_or(u64::MAX);
        let mut box_count = 0u32;

        let mut moov_parsed = false;
        loop {
            if self.stream.eof() {
                break;
            }
            box_count += 1;
            if box_count > MAX_BOXES_PER_CONTAINER {
                return Err(Error::resource("top-level box count exceeds safety cap"));
            }

            let header = match read_box_header(&mut *self.stream, self.file_size, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, self.file_size, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };

            match &header.box_type {
                b"moov" => {
                    self.parse_moov(header.end())?;
                    moov_parsed = true;
                }
                b"moof" => {
                    let (sequence_number, track_fragments) =
                        fragment::parse_moof(&mut *self.stream, header.start, header.end(), &self.recovery)?;
                    self.fragments.insert(sequence_number, track_fragments);
                }
                _ => {}
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }

        if !moov_parsed {
            return Err(Error::format("no moov box present"));
        }
        Ok(())
    }

    fn parse_moov(&mut self, moov_end: u64) -> Result<()> {
        let mut box_count = 0u32;
        while self.stream.tell() + 8 <= moov_end {
            box_count += 1;
            if box_count > MAX_BOXES_PER_CONTAINER {
                return Err(Error::resource("moov box count exceeds safety cap"));
            }
            let header = match read_box_header(&mut *self.stream, moov_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, moov_end, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };
            match &header.box_type {
                b"trak" => self.parse_trak(header.end())?,
                b"udta" => self.parse_udta(header.end())?,
                _ => {}
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    fn parse_trak(&mut self, trak_end: u64) -> Result<()> {
        let mut track = Track {
            track_id: 0,
            handler_type: *b"\0\0\0\0",
            timescale: 0,
            sample_entry: None,
            sample_table: SampleTable::default(),
            planned: Vec::new(),
            position: 0,
        };

        while self.stream.tell() + 8 <= trak_end {
            let header = match read_box_header(&mut *self.stream, trak_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, trak_end, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };
            match &header.box_type {
                b"tkhd" => track.track_id = self.parse_tkhd(header.payload_len)?,
                b"mdia" => self.parse_mdia(header.end(), &mut track)?,
                _ => {}
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }

        if track.track_id == 0 {
            self.compliance.observe("trak box missing a usable tkhd")?;
            return Ok(());
        }

        if track.is_audio() {
            let stream_id = track.track_id;
            let fragment_samples = self.fragments.flatten_track(stream_id);
            track.planned = if fragment_samples.is_empty() {
                track
                    .sample_table
                    .planned_samples()
                    .into_iter()
                    .map(|p| PlannedSample { offset: p.offset, size: p.size, duration: p.duration })
                    .collect()
            } else {
                fragment_samples
                    .into_iter()
                    .map(|s| PlannedSample { offset: s.offset, size: s.size, duration: s.duration })
                    .collect()
            };

            let info = self.build_stream_info(&track);
            self.stream_infos.push(info);
            self.tracks.push(track);
        }
        Ok(())
    }

    /// Version (1) + flags (3) + creation/modification time + track id.
    fn parse_tkhd(&mut self, payload_len: u64) -> Result<u32> {
        let start = self.stream.tell();
        let version = self.stream.read_u8()?;
        self.stream.seek(3, Whence::Current)?;
        let track_id = if version == 1 {
            self.stream.seek(16, Whence::Current)?;
            self.stream.read_u32_be()?
        } else {
            self.stream.seek(8, Whence::Current)?;
            self.stream.read_u32_be()?
        };
        self.stream.seek((start + payload_len) as i64, Whence::Start)?;
        Ok(track_id)
    }

    fn parse_mdia(&mut self, mdia_end: u64, track: &mut Track) -> Result<()> {
        while self.stream.tell() + 8 <= mdia_end {
            let header = match read_box_header(&mut *self.stream, mdia_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, mdia_end, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };
            match &header.box_type {
                b"mdhd" => track.timescale = self.parse_mdhd(header.payload_len)?,
                b"hdlr" => track.handler_type = self.parse_hdlr(header.payload_len)?,
                b"minf" => self.parse_minf(header.end(), track)?,
                _ => {}
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    /// Version (1) + flags (3) + creation/modification time + timescale +
    /// duration, the latter two 32-bit (version 0) or 64-bit (version 1).
    fn parse_mdhd(&mut self, payload_len: u64) -> Result<u32> {
        let start = self.stream.tell();
        let version = self.stream.read_u8()?;
        self.stream.seek(3, Whence::Current)?;
        let timescale = if version == 1 {
            self.stream.seek(16, Whence::Current)?;
            let timescale = self.stream.read_u32_be()?;
            let _duration = self.stream.read_u64_be()?;
            timescale
        } else {
            self.stream.seek(8, Whence::Current)?;
            let timescale = self.stream.read_u32_be()?;
            let _duration = self.stream.read_u32_be()?;
            timescale
        };
        self.stream.seek((start + payload_len) as i64, Whence::Start)?;
        Ok(timescale)
    }

    /// Version/flags (4) + pre-defined (4) + handler type FourCC.
    fn parse_hdlr(&mut self, payload_len: u64) -> Result<[u8; 4]> {
        let start = self.stream.tell();
        self.stream.seek(8, Whence::Current)?;
        let handler_type = self.stream.read_fourcc()?;
        self.stream.seek((start + payload_len) as i64, Whence::Start)?;
        Ok(handler_type)
    }

    fn parse_minf(&mut self, minf_end: u64, track: &mut Track) -> Result<()> {
        while self.stream.tell() + 8 <= minf_end {
            let header = match read_box_header(&mut *self.stream, minf_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, minf_end, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };
            if header.is(b"stbl") {
                self.parse_stbl(header.end(), track)?;
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    fn parse_stbl(&mut self, stbl_end: u64, track: &mut Track) -> Result<()> {
        while self.stream.tell() + 8 <= stbl_end {
            let header = match read_box_header(&mut *self.stream, stbl_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => {
                    if boxes::resync(&mut *self.stream, stbl_end, &self.recovery)? {
                        continue;
                    }
                    break;
                }
            };
            let handler_type = track.handler_type;
            let codec_type = if &handler_type == b"soun" { CodecType::Audio } else { CodecType::Video };
            match &header.box_type {
                b"stsd" => track.sample_entry = sample_table::parse_stsd(&mut *self.stream, header.payload_len, codec_type)?,
                b"stts" => sample_table::parse_stts(&mut *self.stream, &mut track.sample_table)?,
                b"stsc" => sample_table::parse_stsc(&mut *self.stream, &mut track.sample_table)?,
                b"stsz" => sample_table::parse_stsz(&mut *self.stream, &mut track.sample_table)?,
                b"stco" => sample_table::parse_stco(&mut *self.stream, &mut track.sample_table)?,
                b"co64" => sample_table::parse_co64(&mut *self.stream, &mut track.sample_table)?,
                b"stss" => sample_table::parse_stss(&mut *self.stream, &mut track.sample_table)?,
                _ => {
                    let _ = self.compliance.observe("unrecognised stbl child box");
                }
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    fn parse_udta(&mut self, udta_end: u64) -> Result<()> {
        while self.stream.tell() + 8 <= udta_end {
            let header = match read_box_header(&mut *self.stream, udta_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.is(b"meta") {
                self.parse_meta(header.end())?;
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    fn parse_meta(&mut self, meta_end: u64) -> Result<()> {
        // `meta` carries a 4-byte version/flags prefix, unlike most other
        // full boxes' container peers.
        self.stream.seek(4, Whence::Current)?;
        while self.stream.tell() + 8 <= meta_end {
            let header = match read_box_header(&mut *self.stream, meta_end, &self.recovery) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.is(b"ilst") {
                tags::parse_ilst(&mut *self.stream, header.end(), &mut self.tags, &self.recovery)?;
            }
            self.stream.seek(header.end() as i64, Whence::Start)?;
        }
        Ok(())
    }

    fn build_stream_info(&self, track: &Track) -> StreamInfo {
        let entry = track.sample_entry.clone().unwrap_or_default();
        let total_samples = track.planned.len() as u64;
        let duration_ticks: u64 = track.planned.iter().map(|p| u64::from(p.duration)).sum();
        let duration_ms = if track.timescale > 0 { duration_ticks * 1000 / u64::from(track.timescale) } else { 0 };
        StreamInfo {
            stream_id: track.track_id,
            codec_type: CodecType::Audio,
            codec_name: entry.codec_name,
            codec_tag: entry.codec_tag,
            sample_rate: entry.sample_rate,
            channels: entry.channels,
            bits_per_sample: entry.bits_per_sample,
            nominal_bitrate: 0,
            codec_private: entry.codec_private,
            total_samples,
            duration_ms,
            tags: Tags::default(),
        }
    }

    /// Chooses the track with the earliest next-sample timestamp across all
    /// audio tracks, mirroring the container-order fan-in used by the Ogg
    /// demultiplexer for its own multiple logical bitstreams.
    fn next_track_index(&self) -> Option<usize> {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.position < t.planned.len())
            .min_by_key(|(_, t)| t.timestamp_ms(t.position))
            .map(|(i, _)| i)
    }

    fn read_sample_from(&mut self, track_index: usize) -> Result<MediaChunk> {
        let track = &mut self.tracks[track_index];
        let stream_id = track.track_id;
        let sample_index = track.position;
        let planned = &track.planned[sample_index];
        let offset = planned.offset;
        let size = planned.size as usize;
        let timestamp_ms = track.timestamp_ms(sample_index);
        let granule = track.sample_table.sample_time(sample_index);
        let keyframe = track.sample_table.is_sync_sample(sample_index);

        self.stream.seek(offset as i64, Whence::Start)?;
        let mut data = vec![0u8; size];
        self.stream.read_exact(&mut data)?;

        self.tracks[track_index].position += 1;
        Ok(MediaChunk { stream_id, data, granule, timestamp_ms, keyframe, file_offset: offset })
    }
}

impl Demuxer for IsoDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }
        self.walk_top_level()?;
        if self.tracks.is_empty() {
            return Err(Error::format("no audio track present"));
        }
        self.parsed = true;
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.stream_infos
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        let Some(index) = self.next_track_index() else {
            return Ok(MediaChunk::eof(self.tracks.first().map_or(0, |t| t.track_id)));
        };
        self.read_sample_from(index)
    }

    fn read_chunk_for(&mut self, id: u32) -> Result<MediaChunk> {
        let Some(index) = self.tracks.iter().position(|t| t.track_id == id) else {
            return Ok(MediaChunk::eof(id));
        };
        if self.tracks[index].position >= self.tracks[index].planned.len() {
            return Ok(MediaChunk::eof(id));
        }
        self.read_sample_from(index)
    }

    fn seek_to(&mut self, ms: u64) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(Error::logic("parse_container not yet successful"));
        }
        for track in &mut self.tracks {
            if track.timescale == 0 {
                track.position = 0;
                continue;
            }
            let target_ticks = ms * u64::from(track.timescale) / 1000;
            let target_sample = track.sample_table.sample_for_time(target_ticks);
            let synced = track.sample_table.nearest_sync_sample(target_sample.min(track.planned.len().saturating_sub(1)));
            track.position = synced.min(track.planned.len());
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        self.tracks.iter().all(|t| t.position >= t.planned.len())
    }

    fn duration_ms(&self) -> u64 {
        self.stream_infos.iter().map(|s| s.duration_ms).max().unwrap_or(0)
    }

    fn position_ms(&self) -> u64 {
        self.tracks.iter().map(|t| t.timestamp_ms(t.position.min(t.planned.len().saturating_sub(1)))).max().unwrap_or(0)
    }

    fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;
    use crate::config::IsoConfig;

    fn be_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(payload);
        out
    }

    fn build_minimal_mp4(pcm: &[u8]) -> Vec<u8> {
        let ftyp = be_box(b"ftyp", b"isomisom");

        let mut tkhd = vec![0u8; 4]; // version/flags
        tkhd.extend_from_slice(&[0u8; 8]); // creation/modification
        tkhd.extend_from_slice(&1u32.to_be_bytes()); // track id

        let mut mdhd = vec![0u8; 4];
        mdhd.extend_from_slice(&[0u8; 8]);
        mdhd.extend_from_slice(&44_100u32.to_be_bytes()); // timescale
        mdhd.extend_from_slice(&(pcm.len() as u32 / 2).to_be_bytes()); // duration in samples

        let mut hdlr = vec![0u8; 8];
        hdlr.extend_from_slice(b"soun");
        hdlr.extend_from_slice(&[0u8; 12]);

        let mut stsd_entry = vec![0u8; 6]; // reserved
        stsd_entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        stsd_entry.extend_from_slice(&[0u8; 8]); // version/revision/vendor
        stsd_entry.extend_from_slice(&1u16.to_be_bytes()); // channels
        stsd_entry.extend_from_slice(&16u16.to_be_bytes()); // bits per sample
        stsd_entry.extend_from_slice(&[0u8; 4]); // compression id + packet size
        stsd_entry.extend_from_slice(&(44_100u32 << 16).to_be_bytes());
        let lpcm_entry = be_box(b"lpcm", &stsd_entry);

        let mut stsd = vec![0u8; 4];
        stsd.extend_from_slice(&1u32.to_be_bytes());
        stsd.extend_from_slice(&lpcm_entry);

        let sample_count = (pcm.len() / 2) as u32;
        let mut stts = vec![0u8; 4];
        stts.extend_from_slice(&1u32.to_be_bytes());
        stts.extend_from_slice(&sample_count.to_be_bytes());
        stts.extend_from_slice(&1u32.to_be_bytes());

        let mut stsc = vec![0u8; 4];
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&sample_count.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());

        let mut stsz = vec![0u8; 4];
        stsz.extend_from_slice(&2u32.to_be_bytes()); // uniform sample size = 2 bytes
        stsz.extend_from_slice(&sample_count.to_be_bytes());

        let mdat = be_box(b"mdat", pcm);

        let stbl_without_stco = [
            be_box(b"stsd", &stsd),
            be_box(b"stts", &stts),
            be_box(b"stsc", &stsc),
            be_box(b"stsz", &stsz),
        ]
        .concat();

        let mut mvhd = vec![0u8; 4];
        mvhd.extend_from_slice(&[0u8; 8]);
        mvhd.extend_from_slice(&44_100u32.to_be_bytes());
        mvhd.extend_from_slice(&(pcm.len() as u32 / 2).to_be_bytes());

        // The `stco` chunk offset depends on mdat's absolute position, which
        // in turn depends on everything before it — build the header twice,
        // once to measure its length and once with the real offset patched in.
        let build_with_offset = |offset: u32| -> Vec<u8> {
            let mut stco = vec![0u8; 4];
            stco.extend_from_slice(&1u32.to_be_bytes());
            stco.extend_from_slice(&offset.to_be_bytes());
            let stbl = [stbl_without_stco.clone(), be_box(b"stco", &stco)].concat();
            let minf = be_box(b"minf", &be_box(b"stbl", &stbl));
            let mdia = [be_box(b"mdhd", &mdhd), be_box(b"hdlr", &hdlr), minf].concat();
            let trak = be_box(b"trak", &[be_box(b"tkhd", &tkhd), be_box(b"mdia", &mdia)].concat());
            let moov = be_box(b"moov", &[be_box(b"mvhd", &mvhd), trak].concat());
            [ftyp.clone(), moov].concat()
        };

        let header_only = build_with_offset(0);
        let mdat_data_offset = header_only.len() as u32 + 8; // past mdat's own box header
        let mut out = build_with_offset(mdat_data_offset);
        out.extend_from_slice(&mdat);
        out
    }

    #[test]
    fn parses_minimal_mp4_and_reads_one_sample() {
        let pcm = vec![0u8; 8];
        let bytes = build_minimal_mp4(&pcm);
        let mut demux = IsoDemuxer::new(Box::new(MemoryStream::new(bytes)), IsoConfig::default());
        demux.parse_container().unwrap();
        let info = &demux.streams()[0];
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 1);
        assert_eq!(info.total_samples, 4);

        let chunk = demux.read_chunk().unwrap();
        assert!(!chunk.is_eof());
        assert_eq!(chunk.data.len(), 2);
    }

    #[test]
    fn missing_moov_fails_parse() {
        let bytes = be_box(b"free", &[0u8; 4]);
        let mut demux = IsoDemuxer::new(Box::new(MemoryStream::new(bytes)), IsoConfig::default());
        assert!(demux.parse_container().is_err());
    }
}
