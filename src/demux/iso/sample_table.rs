//! Sample description (`stsd`) codec identification and the five `stbl`
//! sample tables, with sample-to-byte and sample-to-time translation.

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::iso::boxes::{read_box_header, BoxHeader};
use crate::demux::{CodecType, RecoveryStats};
use crate::error::Result;

const ELEMENTARY_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_TAG: u8 = 0x04;
const DECODER_SPECIFIC_DESCRIPTOR_TAG: u8 = 0x05;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

/// Decoded sample-entry fields, common across every mapping this
/// demultiplexer recognises.
#[derive(Clone, Debug, Default)]
pub(super) struct SampleEntry {
    pub codec_name: &'static str,
    pub codec_tag: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    pub codec_private: Vec<u8>,
}

/// Reads a `stsd` box's first sample entry and identifies its codec.
pub(super) fn parse_stsd(
    stream: &mut dyn ByteStream,
    payload_len: u64,
    codec_type: CodecType,
) -> Result<Option<SampleEntry>> {
    let stsd_end = stream.tell() + payload_len;
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    if entry_count == 0 {
        stream.seek(stsd_end as i64, Whence::Start)?;
        return Ok(None);
    }

    let recovery = RecoveryStats::default();
    let entry_header = read_box_header(stream, stsd_end, &recovery)?;
    let entry_payload_end = entry_header.end();
    let fourcc = entry_header.box_type;

    let entry = match (&fourcc, codec_type) {
        (b"mp4a", _) => Some(parse_mp4a(stream, entry_payload_end)?),
        (b"alac", _) => Some(parse_alac(stream, entry_payload_end)?),
        (b"fLaC", _) => Some(parse_flac_entry(stream, entry_payload_end)?),
        (b"ulaw", _) => Some(parse_audio_common(stream, entry_payload_end, "mulaw", 0, 8000, 1, 8)?),
        (b"alaw", _) => Some(parse_audio_common(stream, entry_payload_end, "alaw", 0, 8000, 1, 8)?),
        (b"lpcm" | b"sowt" | b"twos" | b"fl32" | b"fl64" | b"in24" | b"in32", _) => {
            Some(parse_pcm(stream, entry_payload_end, &fourcc)?)
        }
        _ if codec_type == CodecType::Video => None,
        _ => Some(parse_audio_common(stream, entry_payload_end, "unknown", u32::from_be_bytes(fourcc), 0, 0, 0)?),
    };

    stream.seek(stsd_end as i64, Whence::Start)?;
    Ok(entry)
}

/// Reserved(6) + data-reference-index(2) + version(2) + revision(2) +
/// vendor(4) + channels(2) + sample-size(2) + compression-id(2) +
/// packet-size(2) + sample-rate(4, 16.16 fixed point).
fn read_audio_sample_entry_header(stream: &mut dyn ByteStream) -> Result<(u16, u16, u32)> {
    stream.seek(16, Whence::Current)?;
    let channels = stream.read_u16_be()?;
    let bits_per_sample = stream.read_u16_be()?;
    stream.seek(4, Whence::Current)?;
    let sample_rate = stream.read_u32_be()? >> 16;
    Ok((channels, bits_per_sample, sample_rate))
}

fn parse_audio_common(
    stream: &mut dyn ByteStream,
    entry_end: u64,
    codec_name: &'static str,
    codec_tag: u32,
    forced_rate: u32,
    forced_channels: u16,
    forced_bits: u16,
) -> Result<SampleEntry> {
    let (channels, bits_per_sample, sample_rate) = read_audio_sample_entry_header(stream)?;
    stream.seek(entry_end as i64, Whence::Start)?;
    Ok(SampleEntry {
        codec_name,
        codec_tag,
        channels: if forced_channels > 0 { forced_channels } else { channels },
        bits_per_sample: if forced_bits > 0 { forced_bits } else { bits_per_sample },
        sample_rate: if forced_rate > 0 { forced_rate } else { sample_rate },
        codec_private: Vec::new(),
    })
}

fn parse_pcm(stream: &mut dyn ByteStream, entry_end: u64, fourcc: &[u8; 4]) -> Result<SampleEntry> {
    let (channels, declared_bits, sample_rate) = read_audio_sample_entry_header(stream)?;
    stream.seek(entry_end as i64, Whence::Start)?;
    let bits_per_sample = match fourcc {
        b"fl32" => 32,
        b"fl64" => 64,
        b"in24" => 24,
        b"in32" => 32,
        _ => declared_bits,
    };
    Ok(SampleEntry {
        codec_name: "pcm",
        codec_tag: u32::from_be_bytes(*fourcc),
        channels,
        bits_per_sample,
        sample_rate,
        codec_private: Vec::new(),
    })
}

/// `mp4a` sample entry: the common audio header, optionally followed by an
/// `esds` box carrying the AAC `AudioSpecificConfig`.
fn parse_mp4a(stream: &mut dyn ByteStream, entry_end: u64) -> Result<SampleEntry> {
    let (channels, bits_per_sample, sample_rate) = read_audio_sample_entry_header(stream)?;
    let recovery = RecoveryStats::default();
    let mut entry = SampleEntry {
        codec_name: "aac",
        codec_tag: u32::from_be_bytes(*b"mp4a"),
        channels,
        bits_per_sample,
        sample_rate,
        codec_private: Vec::new(),
    };

    while stream.tell() + 8 <= entry_end {
        let box_header = match read_box_header(stream, entry_end, &recovery) {
            Ok(h) => h,
            Err(_) => break,
        };
        if box_header.is(b"esds") {
            parse_esds(stream, box_header.payload_len, &mut entry)?;
        }
        stream.seek(box_header.end() as i64, Whence::Start)?;
    }
    stream.seek(entry_end as i64, Whence::Start)?;
    Ok(entry)
}

/// Elementary Stream Descriptor: a chain of MPEG-4 descriptors, each with a
/// tag byte and a variable-length, 7-bit-continuation-coded size.
fn parse_esds(stream: &mut dyn ByteStream, payload_len: u64, entry: &mut SampleEntry) -> Result<()> {
    let payload_end = stream.tell() + payload_len;
    let _version_flags = stream.read_u32_be()?;

    let Some((tag, _)) = read_descriptor_header(stream)? else { return Ok(()) };
    if tag != ELEMENTARY_DESCRIPTOR_TAG {
        stream.seek(payload_end as i64, Whence::Start)?;
        return Ok(());
    }
    stream.seek(3, Whence::Current)?; // ES ID (2) + flags (1)

    let Some((tag, _)) = read_descriptor_header(stream)? else { return Ok(()) };
    if tag != DECODER_CONFIG_TAG {
        stream.seek(payload_end as i64, Whence::Start)?;
        return Ok(());
    }
    let object_type_indication = stream.read_u8()?;
    entry.codec_name = match object_type_indication {
        0x40 | 0x41 | 0x66 | 0x67 | 0x68 => "aac",
        0x69 | 0x6B => "mp3",
        _ => entry.codec_name,
    };
    stream.seek(8, Whence::Current)?; // stream type(1) + buffer size(3) + max bitrate(4)
    let _average_bitrate = stream.read_u32_be()?;

    if let Some((tag, size)) = read_descriptor_header(stream)? {
        if tag == DECODER_SPECIFIC_DESCRIPTOR_TAG && size > 0 {
            let mut asc = vec![0u8; size as usize];
            stream.read_exact(&mut asc)?;
            if let Some((rate, channels)) = decode_audio_specific_config(&asc) {
                entry.sample_rate = rate;
                entry.channels = channels;
            }
            entry.codec_private = asc;
        }
    }

    stream.seek(payload_end as i64, Whence::Start)?;
    Ok(())
}

fn read_descriptor_header(stream: &mut dyn ByteStream) -> Result<Option<(u8, u32)>> {
    let tag = stream.read_u8()?;
    let mut size = 0u32;
    for _ in 0..4 {
        let b = stream.read_u8()?;
        size = (size << 7) | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(Some((tag, size)))
}

/// MPEG-4 `AudioSpecificConfig`: 5-bit object type, 4-bit sample-rate index
/// (or an explicit 24-bit rate when the index is 0xF), 4-bit channel
/// configuration.
fn decode_audio_specific_config(bytes: &[u8]) -> Option<(u32, u16)> {
    if bytes.len() < 2 {
        return None;
    }
    let frequency_index = ((bytes[0] & 0x07) << 1) | (bytes[1] >> 7);
    let channel_config = (bytes[1] >> 3) & 0x0F;
    // Index 0x0F means an explicit 24-bit rate follows, bit-packed across a
    // byte boundary; left unhandled here as it is vanishingly rare in
    // practice, in favour of leaving the sample entry's own declared rate.
    let rate = *AAC_SAMPLE_RATES.get(frequency_index as usize)?;
    Some((rate, u16::from(channel_config)))
}

/// `alac` sample entry: the common audio header followed by a second,
/// nested `alac` box holding the 12-byte ALAC magic cookie.
fn parse_alac(stream: &mut dyn ByteStream, entry_end: u64) -> Result<SampleEntry> {
    let (channels, bits_per_sample, sample_rate) = read_audio_sample_entry_header(stream)?;
    let recovery = RecoveryStats::default();
    let mut entry = SampleEntry {
        codec_name: "alac",
        codec_tag: u32::from_be_bytes(*b"alac"),
        channels,
        bits_per_sample,
        sample_rate,
        codec_private: Vec::new(),
    };

    if stream.tell() + 8 <= entry_end {
        if let Ok(inner) = read_box_header(stream, entry_end, &recovery) {
            if inner.is(b"alac") {
                let mut cookie = vec![0u8; inner.payload_len as usize];
                stream.read_exact(&mut cookie)?;
                if cookie.len() >= 12 {
                    entry.bits_per_sample = u16::from(cookie[5]);
                    entry.channels = u16::from(cookie[9]);
                    entry.sample_rate = u32::from_be_bytes(cookie[8..12].try_into().unwrap_or([0; 4]));
                }
                entry.codec_private = cookie;
            }
        }
    }
    stream.seek(entry_end as i64, Whence::Start)?;
    Ok(entry)
}

/// `fLaC` sample entry (ISO/FLAC mapping): the common audio header followed
/// by a nested `dfLa` box holding the native FLAC metadata-block chain,
/// whose first block is `STREAMINFO`.
fn parse_flac_entry(stream: &mut dyn ByteStream, entry_end: u64) -> Result<SampleEntry> {
    let (mut channels, mut bits_per_sample, mut sample_rate) = read_audio_sample_entry_header(stream)?;
    let recovery = RecoveryStats::default();
    let mut codec_private = Vec::new();

    if stream.tell() + 8 <= entry_end {
        if let Ok(inner) = read_box_header(stream, entry_end, &recovery) {
            if inner.is(b"dfLa") {
                let mut block = vec![0u8; inner.payload_len as usize];
                stream.read_exact(&mut block)?;
                if block.len() >= 1 + 4 + 34 {
                    let body = &block[5..5 + 34];
                    sample_rate = (u32::from(body[10]) << 12) | (u32::from(body[11]) << 4) | (u32::from(body[12]) >> 4);
                    channels = u16::from(((body[12] >> 1) & 0x07) + 1);
                    bits_per_sample = u16::from((((body[12] & 0x01) << 4) | (body[13] >> 4)) + 1);
                }
                codec_private = block;
            }
        }
    }
    stream.seek(entry_end as i64, Whence::Start)?;
    Ok(SampleEntry {
        codec_name: "flac",
        codec_tag: u32::from_be_bytes(*b"fLaC"),
        channels,
        bits_per_sample,
        sample_rate,
        codec_private,
    })
}

/// Sample-to-chunk run: `(first_chunk, samples_per_chunk, sample_description_index)`,
/// 1-based chunk indices as stored.
#[derive(Clone, Copy, Debug)]
pub(super) struct SampleToChunk {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// The five sample tables of one `stbl`, plus the composition-time offsets
/// this demultiplexer decodes but (having no video path) does not act on.
#[derive(Clone, Debug, Default)]
pub(super) struct SampleTable {
    pub time_to_sample: Vec<(u32, u32)>,
    pub sample_to_chunk: Vec<SampleToChunk>,
    pub sample_sizes: Vec<u32>,
    pub uniform_sample_size: u32,
    pub sample_count: u32,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync-sample indices, empty if every sample is a sync sample.
    pub sync_samples: Vec<u32>,
}

impl SampleTable {
    fn sample_size(&self, index: usize) -> Option<u64> {
        if self.uniform_sample_size > 0 {
            Some(u64::from(self.uniform_sample_size))
        } else {
            self.sample_sizes.get(index).map(|&s| u64::from(s))
        }
    }

    fn total_samples(&self) -> usize {
        if self.uniform_sample_size > 0 {
            self.sample_count as usize
        } else {
            self.sample_sizes.len()
        }
    }

    /// Locates the chunk containing `sample_index` (0-based) and the file
    /// offset of the sample within it.
    pub(super) fn sample_offset(&self, sample_index: usize) -> Option<u64> {
        if self.sample_to_chunk.is_empty() || self.chunk_offsets.is_empty() {
            return None;
        }
        let mut sample = 0usize;
        for (run_idx, run) in self.sample_to_chunk.iter().enumerate() {
            let first_chunk = (run.first_chunk.max(1) - 1) as usize;
            let spc = run.samples_per_chunk as usize;
            let next_first_chunk = self
                .sample_to_chunk
                .get(run_idx + 1)
                .map(|r| (r.first_chunk.max(1) - 1) as usize)
                .unwrap_or(self.chunk_offsets.len());

            for chunk in first_chunk..next_first_chunk {
                if sample + spc > sample_index {
                    let chunk_offset = *self.chunk_offsets.get(chunk)?;
                    let mut offset = chunk_offset;
                    for j in sample..sample_index {
                        offset += self.sample_size(j)?;
                    }
                    return Some(offset);
                }
                sample += spc;
            }
        }
        None
    }

    /// Starting timestamp of `sample_index`, in the track's own timescale.
    pub(super) fn sample_time(&self, sample_index: usize) -> u64 {
        let mut time = 0u64;
        let mut sample = 0usize;
        for &(count, delta) in &self.time_to_sample {
            let count = count as usize;
            if sample + count > sample_index {
                return time + (sample_index - sample) as u64 * u64::from(delta);
            }
            time += count as u64 * u64::from(delta);
            sample += count;
        }
        time
    }

    /// Inverse of [`Self::sample_time`]: the index of the last sample whose
    /// start time is at or before `target_time`.
    pub(super) fn sample_for_time(&self, target_time: u64) -> usize {
        let mut time = 0u64;
        let mut sample = 0usize;
        for &(count, delta) in &self.time_to_sample {
            let segment = count as u64 * u64::from(delta);
            if delta == 0 {
                sample += count as usize;
                continue;
            }
            if time + segment > target_time {
                let remaining = target_time - time;
                return sample + (remaining / u64::from(delta)) as usize;
            }
            time += segment;
            sample += count as usize;
        }
        sample
    }

    /// Snaps `sample_index` down to the nearest sync sample at or before it,
    /// or leaves it unchanged if every sample is a sync sample.
    pub(super) fn nearest_sync_sample(&self, sample_index: usize) -> usize {
        if self.sync_samples.is_empty() {
            return sample_index;
        }
        let target = sample_index as u32 + 1; // table is 1-based
        let idx = self.sync_samples.partition_point(|&s| s <= target);
        if idx == 0 {
            0
        } else {
            (self.sync_samples[idx - 1] - 1) as usize
        }
    }

    pub(super) fn is_sync_sample(&self, sample_index: usize) -> bool {
        self.sync_samples.is_empty() || self.sync_samples.binary_search(&(sample_index as u32 + 1)).is_ok()
    }

    pub(super) fn len(&self) -> usize {
        self.total_samples()
    }

    /// Resolves every sample's file offset, size and duration up front, so
    /// the demultiplexer can treat an `stbl`-described track and a
    /// fragment-described track identically once planned.
    pub(super) fn planned_samples(&self) -> Vec<super::PlannedSample> {
        let count = self.total_samples();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let Some(offset) = self.sample_offset(i) else { break };
            let Some(size) = self.sample_size(i) else { break };
            let start = self.sample_time(i);
            let duration = self.sample_time(i + 1).saturating_sub(start);
            out.push(super::PlannedSample { offset, size, duration: duration as u32 });
        }
        out
    }
}

pub(super) fn parse_stts(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    table.time_to_sample.reserve(entry_count as usize);
    for _ in 0..entry_count {
        let count = stream.read_u32_be()?;
        let delta = stream.read_u32_be()?;
        table.time_to_sample.push((count, delta));
    }
    Ok(())
}

pub(super) fn parse_stsc(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    table.sample_to_chunk.reserve(entry_count as usize);
    for _ in 0..entry_count {
        let first_chunk = stream.read_u32_be()?;
        let samples_per_chunk = stream.read_u32_be()?;
        let _sample_description_index = stream.read_u32_be()?;
        table.sample_to_chunk.push(SampleToChunk { first_chunk, samples_per_chunk });
    }
    Ok(())
}

pub(super) fn parse_stsz(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let uniform_size = stream.read_u32_be()?;
    let sample_count = stream.read_u32_be()?;
    table.uniform_sample_size = uniform_size;
    table.sample_count = sample_count;
    if uniform_size == 0 {
        table.sample_sizes.reserve(sample_count as usize);
        for _ in 0..sample_count {
            table.sample_sizes.push(stream.read_u32_be()?);
        }
    }
    Ok(())
}

pub(super) fn parse_stco(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    table.chunk_offsets.reserve(entry_count as usize);
    for _ in 0..entry_count {
        table.chunk_offsets.push(u64::from(stream.read_u32_be()?));
    }
    Ok(())
}

pub(super) fn parse_co64(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    table.chunk_offsets.reserve(entry_count as usize);
    for _ in 0..entry_count {
        table.chunk_offsets.push(stream.read_u64_be()?);
    }
    Ok(())
}

pub(super) fn parse_stss(stream: &mut dyn ByteStream, table: &mut SampleTable) -> Result<()> {
    let _version_flags = stream.read_u32_be()?;
    let entry_count = stream.read_u32_be()?;
    table.sync_samples.reserve(entry_count as usize);
    for _ in 0..entry_count {
        table.sync_samples.push(stream.read_u32_be()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_chunks() -> SampleTable {
        SampleTable {
            sample_to_chunk: vec![SampleToChunk { first_chunk: 1, samples_per_chunk: 2 }],
            sample_sizes: vec![10, 20, 30, 40],
            chunk_offsets: vec![1000, 2000],
            ..Default::default()
        }
    }

    #[test]
    fn sample_offset_accounts_for_preceding_sizes_in_chunk() {
        let table = table_with_chunks();
        assert_eq!(table.sample_offset(0), Some(1000));
        assert_eq!(table.sample_offset(1), Some(1010));
        assert_eq!(table.sample_offset(2), Some(2000));
        assert_eq!(table.sample_offset(3), Some(2040));
    }

    #[test]
    fn sample_time_walks_run_length_table() {
        let table = SampleTable {
            time_to_sample: vec![(2, 1024), (1, 512)],
            ..Default::default()
        };
        assert_eq!(table.sample_time(0), 0);
        assert_eq!(table.sample_time(1), 1024);
        assert_eq!(table.sample_time(2), 2048);
    }

    #[test]
    fn sample_for_time_inverts_sample_time() {
        let table = SampleTable {
            time_to_sample: vec![(4, 1024)],
            ..Default::default()
        };
        assert_eq!(table.sample_for_time(0), 0);
        assert_eq!(table.sample_for_time(2048), 2);
    }

    #[test]
    fn nearest_sync_sample_snaps_down() {
        let table = SampleTable {
            sync_samples: vec![1, 10, 20],
            ..Default::default()
        };
        assert_eq!(table.nearest_sync_sample(15), 9);
        assert_eq!(table.nearest_sync_sample(0), 0);
    }

    #[test]
    fn decodes_aac_audio_specific_config() {
        // object type 2 (AAC LC), frequency index 4 (44100), channel config 2.
        let asc = [0x12, 0x10];
        let (rate, channels) = decode_audio_specific_config(&asc).unwrap();
        assert_eq!(rate, 44_100);
        assert_eq!(channels, 2);
    }
}
