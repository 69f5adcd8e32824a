//! RIFF/IFF demultiplexer: `RIFF...WAVE` (little-endian) and
//! `FORM...AIFF`/`AIFC` (big-endian) share one flat chunk-list walker.

mod codec;

use extended::Extended;

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::{CodecType, Demuxer, MediaChunk, RecoveryStats, StreamInfo, Tags};
use crate::error::{Error, Result};

const RECOVERY_WINDOW: usize = 4096;
const KNOWN_FOURCCS: &[[u8; 4]] = &[
    *b"RIFF", *b"FORM", *b"LIST", *b"fmt ", *b"data", *b"COMM", *b"SSND",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Container {
    Wave,
    Aiff,
}

const STREAM_ID: u32 = 1;

/// Demultiplexer for WAVE and AIFF/AIFC containers.
pub struct RiffDemuxer {
    stream: Box<dyn ByteStream>,
    container: Option<Container>,
    file_size: u64,
    info: Option<StreamInfo>,
    data_offset: u64,
    data_size: u64,
    block_align: u32,
    fallback_mode: bool,
    position_bytes: u64,
    recovery: RecoveryStats,
}

impl RiffDemuxer {
    #[must_use]
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            container: None,
            file_size: 0,
            info: None,
            data_offset: 0,
            data_size: 0,
            block_align: 0,
            fallback_mode: false,
            position_bytes: 0,
            recovery: RecoveryStats::default(),
        }
    }

    /// Returns whether the form type was `AIFC` (only meaningful when the
    /// container is [`Container::Aiff`]).
    fn read_top_header(&mut self) -> Result<bool> {
        let magic = self.stream.read_fourcc()?;
        self.container = Some(match &magic {
            b"RIFF" => Container::Wave,
            b"FORM" => Container::Aiff,
            _ => return Err(Error::format("not a RIFF or FORM container")),
        });

        let size = match self.container {
            Some(Container::Wave) => self.stream.read_u32_le()?,
            Some(Container::Aiff) => self.stream.read_u32_be()?,
            None => unreachable!(),
        };
        self.file_size = u64::from(size) + 8;

        let form_type = self.stream.read_fourcc()?;
        match (self.container, &form_type) {
            (Some(Container::Wave), b"WAVE") => Ok(false),
            (Some(Container::Aiff), b"AIFF") => Ok(false),
            (Some(Container::Aiff), b"AIFC") => Ok(true),
            _ => Err(Error::format("unrecognised form type")),
        }
    }

    fn read_chunk_header(&mut self) -> Result<([u8; 4], u64)> {
        let id = self.stream.read_fourcc()?;
        let size = match self.container {
            Some(Container::Wave) => u64::from(self.stream.read_u32_le()?),
            Some(Container::Aiff) => u64::from(self.stream.read_u32_be()?),
            None => unreachable!(),
        };
        let remaining = self.file_size.saturating_sub(self.stream.tell());
        let clamped = if size > remaining {
            self.recovery.record_clamped_size();
            remaining
        } else {
            size
        };
        Ok((id, clamped))
    }

    /// Scans forward in `RECOVERY_WINDOW`-byte windows, 3-byte overlapped,
    /// for a known four-character code, after an unparseable chunk header.
    fn resync(&mut self) -> Result<()> {
        self.recovery.record_skipped_unknown();
        let mut window = vec![0u8; RECOVERY_WINDOW];
        loop {
            let start = self.stream.tell();
            if self.file_size != 0 && start >= self.file_size {
                return Err(Error::format("no recognisable chunk found during resync"));
            }
            let n = self.stream.read(&mut window)?;
            if n == 0 {
                return Err(Error::format("no recognisable chunk found during resync"));
            }
            for i in 0..n.saturating_sub(3) {
                if KNOWN_FOURCCS.iter().any(|fourcc| fourcc == &window[i..i + 4]) {
                    self.stream.seek((start + i as u64) as i64, Whence::Start)?;
                    return Ok(());
                }
            }
            // Overlap the last 3 bytes so a FourCC spanning a window
            // boundary isn't missed.
            self.stream.seek(start as i64 + n as i64 - 3, Whence::Start)?;
        }
    }

    fn parse_wave_fmt(&mut self, size: u64) -> Result<StreamInfo> {
        let format_tag = self.stream.read_u16_le()?;
        let channels = self.stream.read_u16_le()?;
        let sample_rate = self.stream.read_u32_le()?;
        let avg_bytes_per_sec = self.stream.read_u32_le()?;
        let block_align = self.stream.read_u16_le()?;
        let bits_per_sample = if size >= 16 { self.stream.read_u16_le()? } else { 0 };

        let mut codec_private = Vec::new();
        if size > 16 {
            let extra_size = self.stream.read_u16_le()?;
            let extra_size = u64::from(extra_size).min(size - 18);
            codec_private = vec![0u8; extra_size as usize];
            self.stream.read_exact(&mut codec_private)?;
            let consumed = 18 + extra_size;
            if consumed < size {
                self.stream.seek((size - consumed) as i64, Whence::Current)?;
            }
        } else if size < 16 {
            let remaining = 16 - size;
            self.stream.seek(remaining as i64, Whence::Current)?;
        }

        self.block_align = u32::from(block_align);

        Ok(StreamInfo {
            stream_id: STREAM_ID,
            codec_type: CodecType::Audio,
            codec_name: codec::wave_codec_name(format_tag),
            codec_tag: u32::from(format_tag),
            sample_rate,
            channels,
            bits_per_sample,
            nominal_bitrate: avg_bytes_per_sec.saturating_mul(8),
            codec_private,
            total_samples: 0,
            duration_ms: 0,
            tags: Tags::default(),
        })
    }

    fn parse_aiff_comm(&mut self, is_aifc: bool) -> Result<StreamInfo> {
        let channels = self.stream.read_u16_be()?;
        let sample_frames = self.stream.read_u32_be()?;
        let bits_per_sample = self.stream.read_u16_be()?;
        let mut extended_buf = [0u8; 10];
        self.stream.read_exact(&mut extended_buf)?;
        let sample_rate = Extended::from_be_bytes(extended_buf).to_f64() as u32;

        let (codec_tag, codec_name) = if is_aifc {
            let fourcc = self.stream.read_fourcc()?;
            (u32::from_be_bytes(fourcc), codec::aifc_codec_name(&fourcc))
        } else {
            (0, "pcm")
        };

        self.block_align = u32::from(channels) * u32::from(bits_per_sample.div_ceil(8));

        Ok(StreamInfo {
            stream_id: STREAM_ID,
            codec_type: CodecType::Audio,
            codec_name,
            codec_tag,
            sample_rate,
            channels,
            bits_per_sample,
            nominal_bitrate: 0,
            codec_private: Vec::new(),
            total_samples: u64::from(sample_frames),
            duration_ms: 0,
            tags: Tags::default(),
        })
    }

    fn parse_list_info(&mut self, size: u64, tags: &mut Tags) -> Result<()> {
        let list_type = self.stream.read_fourcc()?;
        let mut remaining = size.saturating_sub(4);
        if &list_type != b"INFO" {
            self.stream.seek(remaining as i64, Whence::Current)?;
            return Ok(());
        }
        while remaining >= 8 {
            let tag = self.stream.read_fourcc()?;
            let tag_size = u64::from(self.stream.read_u32_le()?);
            let padded = tag_size + (tag_size % 2);
            if padded + 8 > remaining {
                break;
            }
            let value = self.stream.read_fixed_string(tag_size as usize)?;
            let value = value.trim_end_matches('\0').to_string();
            if tag_size % 2 == 1 {
                self.stream.seek(1, Whence::Current)?;
            }
            match &tag {
                b"INAM" => tags.title = Some(value),
                b"IART" => tags.artist = Some(value),
                b"IPRD" => tags.album = Some(value),
                _ => {}
            }
            remaining -= padded + 8;
        }
        if remaining > 0 {
            self.stream.seek(remaining as i64, Whence::Current)?;
        }
        Ok(())
    }
}

impl Demuxer for RiffDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.info.is_some() {
            return Ok(());
        }
        let is_aifc = self.read_top_header()?;

        let mut tags = Tags::default();
        let mut fact_samples: Option<u64> = None;

        loop {
            let header_pos = self.stream.tell();
            if self.file_size != 0 && header_pos >= self.file_size {
                break;
            }
            let header = self.read_chunk_header();
            let (id, size) = match header {
                Ok(v) => v,
                Err(_) => {
                    self.resync()?;
                    continue;
                }
            };
            let payload_start = self.stream.tell();

            match (&id, self.container) {
                (b"fmt ", Some(Container::Wave)) => {
                    let info = self.parse_wave_fmt(size)?;
                    self.info = Some(info);
                }
                (b"data", Some(Container::Wave)) => {
                    self.data_offset = payload_start;
                    self.data_size = size;
                }
                (b"fact", Some(Container::Wave)) => {
                    fact_samples = Some(u64::from(self.stream.read_u32_le()?));
                }
                (b"LIST", Some(Container::Wave)) => {
                    self.parse_list_info(size, &mut tags)?;
                    continue;
                }
                (b"COMM", Some(Container::Aiff)) => {
                    let info = self.parse_aiff_comm(is_aifc)?;
                    self.info = Some(info);
                }
                (b"SSND", Some(Container::Aiff)) => {
                    let offset = u64::from(self.stream.read_u32_be()?);
                    let _block_size = self.stream.read_u32_be()?;
                    self.data_offset = payload_start + 8 + offset;
                    self.data_size = size.saturating_sub(8 + offset);
                }
                _ => {}
            }

            let padded = size + (size % 2);
            let consumed = self.stream.tell().saturating_sub(payload_start);
            if padded > consumed {
                self.stream.seek((padded - consumed) as i64, Whence::Current)?;
            }
        }

        let Some(mut info) = self.info.take() else {
            return Err(Error::format("missing fmt/COMM chunk"));
        };
        if self.data_offset == 0 || self.data_size == 0 {
            return Err(Error::format("missing data/SSND chunk"));
        }

        info.total_samples = match (self.container, fact_samples) {
            (Some(Container::Wave), Some(n)) => n,
            (Some(Container::Wave), None) if self.block_align > 0 => {
                self.data_size / u64::from(self.block_align)
            }
            (Some(Container::Aiff), _) => info.total_samples,
            _ => 0,
        };
        info.duration_ms = if info.sample_rate > 0 {
            info.total_samples * 1000 / u64::from(info.sample_rate)
        } else {
            0
        };
        info.tags = tags;
        self.info = Some(info);
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        std::slice::from_ref(self.info.as_ref().expect("parse_container succeeded"))
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.read_chunk_for(STREAM_ID)
    }

    fn read_chunk_for(&mut self, id: u32) -> Result<MediaChunk> {
        if id != STREAM_ID {
            return Ok(MediaChunk::eof(id));
        }
        let Some(info) = &self.info else {
            return Err(Error::logic("parse_container not yet successful"));
        };
        if self.position_bytes >= self.data_size {
            return Ok(MediaChunk::eof(STREAM_ID));
        }

        let chunk_bytes: u64 = if self.block_align > 0 {
            // Round toward a 4 KiB target, in whole blocks.
            let target = 4096u64.max(u64::from(self.block_align));
            (target / u64::from(self.block_align)).max(1) * u64::from(self.block_align)
        } else {
            4096
        };
        let remaining = self.data_size - self.position_bytes;
        let want = chunk_bytes.min(remaining) as usize;

        let file_offset = self.data_offset + self.position_bytes;
        self.stream.seek(file_offset as i64, Whence::Start)?;
        let mut data = vec![0u8; want];
        self.stream.read_exact(&mut data)?;

        let sample_offset = if self.block_align > 0 {
            self.position_bytes / u64::from(self.block_align)
        } else if info.nominal_bitrate > 0 {
            self.position_bytes * 8 * 1000 / u64::from(info.nominal_bitrate) * u64::from(info.sample_rate) / 1000
        } else {
            0
        };
        let timestamp_ms = if info.sample_rate > 0 {
            sample_offset * 1000 / u64::from(info.sample_rate)
        } else {
            0
        };

        self.position_bytes += want as u64;

        Ok(MediaChunk {
            stream_id: STREAM_ID,
            data,
            granule: sample_offset,
            timestamp_ms,
            keyframe: true,
            file_offset,
        })
    }

    fn seek_to(&mut self, ms: u64) -> Result<()> {
        let Some(info) = &self.info else {
            return Err(Error::logic("parse_container not yet successful"));
        };
        let target_sample = ms * u64::from(info.sample_rate) / 1000;
        let target_bytes = if self.block_align > 0 {
            target_sample * u64::from(self.block_align)
        } else if info.nominal_bitrate > 0 {
            ms * u64::from(info.nominal_bitrate) / 8 / 1000
        } else {
            0
        };
        self.position_bytes = target_bytes.min(self.data_size);
        Ok(())
    }

    fn eof(&self) -> bool {
        self.position_bytes >= self.data_size
    }

    fn duration_ms(&self) -> u64 {
        self.info.as_ref().map_or(0, |i| i.duration_ms)
    }

    fn position_ms(&self) -> u64 {
        let Some(info) = &self.info else { return 0 };
        if self.block_align == 0 || info.sample_rate == 0 {
            return 0;
        }
        let sample = self.position_bytes / u64::from(self.block_align);
        sample * 1000 / u64::from(info.sample_rate)
    }

    fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    fn build_wave(pcm: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        let data_size = pcm.len() as u32;
        let riff_size = 4 + (8 + 16) + (8 + data_size);
        out.extend_from_slice(&riff_size.to_le_bytes());
        out.extend_from_slice(b"WAVE");

        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&44100u32.to_le_bytes());
        out.extend_from_slice(&88200u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // block align
        out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_size.to_le_bytes());
        out.extend_from_slice(pcm);
        out
    }

    #[test]
    fn parses_minimal_wave_and_reads_chunk() {
        let pcm = vec![0u8; 8];
        let bytes = build_wave(&pcm);
        let mut demux = RiffDemuxer::new(Box::new(MemoryStream::new(bytes)));
        demux.parse_container().unwrap();
        let info = &demux.streams()[0];
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.codec_name, "pcm");

        let chunk = demux.read_chunk().unwrap();
        assert_eq!(chunk.data.len(), 8);
        let eof_chunk = demux.read_chunk().unwrap();
        assert!(eof_chunk.is_eof());
    }

    #[test]
    fn missing_data_chunk_fails_parse() {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&20u32.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);

        let mut demux = RiffDemuxer::new(Box::new(MemoryStream::new(out)));
        assert!(demux.parse_container().is_err());
    }
}
