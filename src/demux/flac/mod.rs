//! Native FLAC demultiplexer (RFC 9639): metadata-block chain, frame
//! synchronisation with CRC validation, and three-tier seeking.

mod frame;
mod index;
mod metadata;

use crate::bytestream::{ByteStream, Whence};
use crate::config::{CrcValidation, FlacConfig, StreamableSubsetMode};
use crate::demux::flac::index::{FrameIndexEntry, MAX_INDEX_ENTRIES, MIN_INDEX_SPACING_MS};
use crate::demux::flac::metadata::{SeekPoint, StreamInfoBlock};
use crate::demux::{CodecType, Demuxer, MediaChunk, RecoveryStats, StreamInfo, Tags};
use crate::error::{Error, Result};

const STREAM_ID: u32 = 1;
const MAGIC: &[u8; 4] = b"fLaC";
const MAX_STREAMABLE_BLOCK_SIZE: u32 = 16_384;
const MAX_STREAMABLE_BLOCK_SIZE_LOW_RATE: u32 = 4_608;
const LOW_RATE_THRESHOLD: u32 = 48_000;

/// Demultiplexer for native FLAC (`fLaC` signature) streams.
pub struct FlacDemuxer {
    stream: Box<dyn ByteStream>,
    config: FlacConfig,
    info: Option<StreamInfoBlock>,
    stream_info: Option<StreamInfo>,
    seektable: Vec<SeekPoint>,
    frame_index: Vec<FrameIndexEntry>,
    first_frame_offset: u64,
    position_sample: u64,
    crc_error_streak: u32,
    crc_checks_disabled: bool,
    eof: bool,
    recovery: RecoveryStats,
}

impl FlacDemuxer {
    #[must_use]
    pub fn new(stream: Box<dyn ByteStream>, config: FlacConfig) -> Self {
        Self {
            stream,
            config,
            info: None,
            stream_info: None,
            seektable: Vec::new(),
            frame_index: Vec::new(),
            first_frame_offset: 0,
            position_sample: 0,
            crc_error_streak: 0,
            crc_checks_disabled: false,
            eof: false,
            recovery: RecoveryStats::default(),
        }
    }

    fn parse_metadata_chain(&mut self, tags: &mut Tags) -> Result<StreamInfoBlock> {
        let mut magic = [0u8; 4];
        self.stream.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::format("missing fLaC stream marker"));
        }

        let mut info: Option<StreamInfoBlock> = None;
        loop {
            let (is_last, block_type, length) = metadata::read_block_header(&mut *self.stream)?;
            if info.is_none() && block_type != metadata::BLOCK_STREAMINFO {
                return Err(Error::format("STREAMINFO must be the first metadata block"));
            }
            match block_type {
                metadata::BLOCK_STREAMINFO => {
                    info = Some(metadata::parse_streaminfo(&mut *self.stream, length)?);
                }
                metadata::BLOCK_SEEKTABLE => {
                    self.seektable = metadata::parse_seektable(&mut *self.stream, length)?;
                }
                metadata::BLOCK_VORBIS_COMMENT => {
                    metadata::parse_vorbis_comment(&mut *self.stream, length, tags)?;
                }
                _ => {
                    metadata::skip_block(&mut *self.stream, block_type, length, &self.recovery)?;
                }
            }
            if is_last {
                break;
            }
        }

        info.ok_or_else(|| Error::format("no STREAMINFO block present"))
    }

    fn validate_streamable_subset(&self, info: &StreamInfoBlock) {
        if self.config.streamable_subset_mode == StreamableSubsetMode::Disabled {
            return;
        }
        let limit = if info.sample_rate <= LOW_RATE_THRESHOLD {
            MAX_STREAMABLE_BLOCK_SIZE_LOW_RATE
        } else {
            MAX_STREAMABLE_BLOCK_SIZE
        };
        if u32::from(info.max_block_size) > limit {
            self.recovery.record_reserved_value_tolerated();
        }
    }

    /// Walks every frame header from the first frame to end-of-stream,
    /// recording a sparse index (roughly one entry per second) and deriving
    /// the total sample count when `STREAMINFO` did not declare one.
    fn build_frame_index(&mut self, info: &StreamInfoBlock) -> Result<u64> {
        if !self.config.frame_indexing_enabled {
            return Ok(info.total_samples);
        }

        let mut offset = self.first_frame_offset;
        let mut last_index_ms: i64 = -MIN_INDEX_SPACING_MS;
        let mut end_sample = info.total_samples;

        loop {
            if self.stream.seek(offset as i64, Whence::Start).is_err() {
                break;
            }
            let header = match frame::try_read_header(&mut *self.stream, info) {
                Ok(Some(h)) => h,
                _ => {
                    self.recovery.record_skipped_unknown();
                    break;
                }
            };

            let ms = (header.start_sample * 1000 / u64::from(info.sample_rate.max(1))) as i64;
            if self.frame_index.len() < MAX_INDEX_ENTRIES && ms - last_index_ms >= MIN_INDEX_SPACING_MS {
                self.frame_index.push(FrameIndexEntry { sample: header.start_sample, offset });
                last_index_ms = ms;
            }

            end_sample = header.start_sample + u64::from(header.block_size);

            let max_bytes = frame::max_frame_bytes(header.block_size, header.channels, header.bits_per_sample);
            let search_from = offset + header.header_len;
            let window = max_bytes.min(frame::MAX_SCAN_WINDOW);
            match frame::find_next_header(&mut *self.stream, info, search_from, window)? {
                Some(next_offset) => offset = next_offset,
                None => break,
            }
        }

        Ok(end_sample)
    }

    /// Reads the frame starting at `offset`, returning its header, byte
    /// span, and whether CRC-16 validation (if active) passed.
    fn read_frame_at(&mut self, info: &StreamInfoBlock, offset: u64) -> Result<(frame::FrameHeader, Vec<u8>, bool)> {
        self.stream.seek(offset as i64, Whence::Start)?;
        let header = frame::try_read_header(&mut *self.stream, info)?
            .ok_or_else(|| Error::format("lost frame synchronisation"))?;

        let max_bytes = frame::max_frame_bytes(header.block_size, header.channels, header.bits_per_sample);
        let search_from = offset + header.header_len;
        let window = max_bytes.min(frame::MAX_SCAN_WINDOW);
        let frame_end = match frame::find_next_header(&mut *self.stream, info, search_from, window)? {
            Some(next_offset) => next_offset,
            None => self.stream.size().unwrap_or(search_from),
        };

        let len = frame_end.saturating_sub(offset) as usize;
        self.stream.seek(offset as i64, Whence::Start)?;
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data)?;

        let crc_ok = if self.crc_checks_disabled || self.config.crc_validation == CrcValidation::Disabled {
            true
        } else if data.len() >= 2 {
            frame::crc16(&data[..data.len() - 2]) == u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]])
        } else {
            false
        };

        Ok((header, data, crc_ok))
    }

    /// Re-syncs from `offset` and steps frame by frame until the current
    /// frame's sample span covers `target_sample`, per the indexed-seek
    /// strategy: land on the nearest indexed offset, then walk forward
    /// rather than trusting the index entry itself to be the answer. Stops
    /// and returns the last frame found if sync is lost or the stream ends
    /// before `target_sample` is reached.
    fn step_to_target_sample(&mut self, info: &StreamInfoBlock, mut offset: u64, target_sample: u64) -> Result<u64> {
        loop {
            if self.stream.seek(offset as i64, Whence::Start).is_err() {
                return Ok(offset);
            }
            let header = match frame::try_read_header(&mut *self.stream, info) {
                Ok(Some(h)) => h,
                _ => return Ok(offset),
            };
            if header.start_sample + u64::from(header.block_size) > target_sample {
                return Ok(offset);
            }

            let max_bytes = frame::max_frame_bytes(header.block_size, header.channels, header.bits_per_sample);
            let search_from = offset + header.header_len;
            let window = max_bytes.min(frame::MAX_SCAN_WINDOW);
            match frame::find_next_header(&mut *self.stream, info, search_from, window)? {
                Some(next_offset) => offset = next_offset,
                None => return Ok(offset),
            }
        }
    }
}

impl Demuxer for FlacDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.info.is_some() {
            return Ok(());
        }

        let mut tags = Tags::default();
        let info = self.parse_metadata_chain(&mut tags)?;
        self.validate_streamable_subset(&info);
        self.first_frame_offset = self.stream.tell();

        let end_sample = self.build_frame_index(&info)?;
        let total_samples = if info.total_samples > 0 { info.total_samples } else { end_sample };
        let duration_ms = if info.sample_rate > 0 { total_samples * 1000 / u64::from(info.sample_rate) } else { 0 };

        self.stream_info = Some(StreamInfo {
            stream_id: STREAM_ID,
            codec_type: CodecType::Audio,
            codec_name: "flac",
            codec_tag: 0,
            sample_rate: info.sample_rate,
            channels: u16::from(info.channels),
            bits_per_sample: u16::from(info.bits_per_sample),
            nominal_bitrate: 0,
            codec_private: Vec::new(),
            total_samples,
            duration_ms,
            tags,
        });
        self.info = Some(info);
        self.stream.seek(self.first_frame_offset as i64, Whence::Start)?;
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        std::slice::from_ref(self.stream_info.as_ref().expect("parse_container succeeded"))
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.read_chunk_for(STREAM_ID)
    }

    fn read_chunk_for(&mut self, id: u32) -> Result<MediaChunk> {
        if id != STREAM_ID {
            return Ok(MediaChunk::eof(id));
        }
        let Some(info) = self.info else {
            return Err(Error::logic("parse_container not yet successful"));
        };
        if self.eof {
            return Ok(MediaChunk::eof(STREAM_ID));
        }

        let offset = self.stream.tell();
        let (header, data, crc_ok) = match self.read_frame_at(&info, offset) {
            Ok(v) => v,
            Err(_) => {
                self.eof = true;
                return Ok(MediaChunk::eof(STREAM_ID));
            }
        };

        // Always advance past this frame first, so a CRC-driven retry below
        // re-enters on the next frame rather than looping on this one.
        self.stream.seek((offset + data.len() as u64) as i64, Whence::Start)?;
        if self.stream.eof() {
            self.eof = true;
        }

        if !crc_ok {
            self.recovery.record_checksum_failure();
            if self.config.crc_validation == CrcValidation::Strict {
                return self.read_chunk_for(STREAM_ID);
            }
            if self.config.crc_validation == CrcValidation::Enabled {
                self.crc_error_streak += 1;
                if self.crc_error_streak > self.config.crc_error_threshold {
                    self.crc_checks_disabled = true;
                }
            }
        } else {
            self.crc_error_streak = 0;
        }

        self.position_sample = header.start_sample + u64::from(header.block_size);
        let timestamp_ms = if info.sample_rate > 0 { header.start_sample * 1000 / u64::from(info.sample_rate) } else { 0 };

        Ok(MediaChunk {
            stream_id: STREAM_ID,
            data,
            granule: header.start_sample,
            timestamp_ms,
            keyframe: true,
            file_offset: offset,
        })
    }

    fn seek_to(&mut self, ms: u64) -> Result<()> {
        let Some(info) = self.info else {
            return Err(Error::logic("parse_container not yet successful"));
        };
        let target_sample = ms * u64::from(info.sample_rate) / 1000;
        let base_offset = index::resolve_seek_offset(&self.frame_index, &self.seektable, self.first_frame_offset, target_sample);
        let offset = self.step_to_target_sample(&info, base_offset, target_sample)?;
        self.stream.seek(offset as i64, Whence::Start)?;
        self.position_sample = target_sample;
        self.eof = false;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.stream_info.as_ref().map_or(0, |i| i.duration_ms)
    }

    fn position_ms(&self) -> u64 {
        let Some(info) = self.info else { return 0 };
        if info.sample_rate == 0 {
            return 0;
        }
        self.position_sample * 1000 / u64::from(info.sample_rate)
    }

    fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    fn encode_streaminfo(sample_rate: u32, channels: u8, bits_per_sample: u8, total_samples: u64) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[0..2].copy_from_slice(&4096u16.to_be_bytes());
        out[2..4].copy_from_slice(&4096u16.to_be_bytes());
        out[10] = (sample_rate >> 12) as u8;
        out[11] = (sample_rate >> 4) as u8;
        out[12] = (((sample_rate & 0x0F) as u8) << 4) | (((channels - 1) & 0x07) << 1) | (((bits_per_sample - 1) >> 4) & 0x01);
        out[13] = (((bits_per_sample - 1) & 0x0F) << 4) | ((total_samples >> 32) as u8 & 0x0F);
        out[14] = (total_samples >> 24) as u8;
        out[15] = (total_samples >> 16) as u8;
        out[16] = (total_samples >> 8) as u8;
        out[17] = total_samples as u8;
        out
    }

    fn build_frame_bytes(block_size_code: u8, frame_number: u8, samples: &[u8]) -> Vec<u8> {
        // Fixed-blocksize frame, 44.1kHz/16bit-from-streaminfo, mono.
        let mut header = vec![0xFFu8, 0xF8, (block_size_code << 4) | 0x00, 0x00];
        header.push(frame_number); // UTF-8 coded frame number, single byte form
        let crc = super::frame::crc8(&header);
        header.push(crc);
        let mut out = header;
        out.extend_from_slice(samples);
        let footer_crc = super::frame::crc16(&out);
        out.extend_from_slice(&footer_crc.to_be_bytes());
        out
    }

    fn build_flac(streaminfo: [u8; 34], frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"fLaC");
        out.push(0x80); // last-block flag set, type STREAMINFO
        out.extend_from_slice(&[0, 0, 34]);
        out.extend_from_slice(&streaminfo);
        for frame in frames {
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn parses_minimal_flac_and_reads_one_frame() {
        let streaminfo = encode_streaminfo(44_100, 1, 16, 0);
        let frame_bytes = build_frame_bytes(0x1, 0, &[0u8; 32]); // block size code 1 -> 192 samples
        let bytes = build_flac(streaminfo, &[frame_bytes]);

        let mut demux = FlacDemuxer::new(Box::new(MemoryStream::new(bytes)), FlacConfig::default());
        demux.parse_container().unwrap();
        let info = &demux.streams()[0];
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 1);

        let chunk = demux.read_chunk().unwrap();
        assert!(!chunk.is_eof());
        assert_eq!(chunk.granule, 0);

        let eof_chunk = demux.read_chunk().unwrap();
        assert!(eof_chunk.is_eof());
    }

    #[test]
    fn missing_streaminfo_fails_parse() {
        let mut out = Vec::new();
        out.extend_from_slice(b"fLaC");
        out.push(0x81); // last-block flag set, type = PADDING (1)
        out.extend_from_slice(&[0, 0, 4]);
        out.extend_from_slice(&[0u8; 4]);
        let mut demux = FlacDemuxer::new(Box::new(MemoryStream::new(out)), FlacConfig::default());
        assert!(demux.parse_container().is_err());
    }
}
