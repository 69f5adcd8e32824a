//! `STREAMINFO` and the rest of the metadata-block chain preceding the first
//! frame (RFC 9639 §8).

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::tag;
use crate::demux::{RecoveryStats, Tags};
use crate::error::{Error, Result};

pub(super) const BLOCK_STREAMINFO: u8 = 0;
pub(super) const BLOCK_PADDING: u8 = 1;
pub(super) const BLOCK_APPLICATION: u8 = 2;
pub(super) const BLOCK_SEEKTABLE: u8 = 3;
pub(super) const BLOCK_VORBIS_COMMENT: u8 = 4;
pub(super) const BLOCK_CUESHEET: u8 = 5;
pub(super) const BLOCK_PICTURE: u8 = 6;

const SEEKPOINT_PLACEHOLDER: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const MAX_SEEKPOINTS: usize = 50_000;
const MAX_COMMENT_BLOCK_BYTES: u64 = 1_000 * 8 * 1024;
const MAX_PICTURE_BYTES: u64 = 16 * 1024 * 1024;

/// The fixed 34-byte `STREAMINFO` body, decoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamInfoBlock {
    pub min_block_size: u16,
    pub max_block_size: u16,
    pub min_frame_size: u32,
    pub max_frame_size: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
    pub md5: [u8; 16],
}

/// One `SEEKTABLE` entry with placeholder points already filtered out.
#[derive(Clone, Copy, Debug)]
pub struct SeekPoint {
    pub sample_number: u64,
    pub stream_offset: u64,
    pub frame_samples: u16,
}

/// Reads the 4-byte metadata block header: last-block flag, type, length.
pub(super) fn read_block_header(stream: &mut dyn ByteStream) -> Result<(bool, u8, u32)> {
    let first = stream.read_u8()?;
    let is_last = first & 0x80 != 0;
    let block_type = first & 0x7F;
    let hi = stream.read_u8()?;
    let mid = stream.read_u8()?;
    let lo = stream.read_u8()?;
    let length = u32::from_be_bytes([0, hi, mid, lo]);
    Ok((is_last, block_type, length))
}

pub(super) fn parse_streaminfo(stream: &mut dyn ByteStream, length: u32) -> Result<StreamInfoBlock> {
    if length < 34 {
        return Err(Error::format("STREAMINFO block shorter than 34 bytes"));
    }
    let min_block_size = stream.read_u16_be()?;
    let max_block_size = stream.read_u16_be()?;

    let mut frame_size_buf = [0u8; 6];
    stream.read_exact(&mut frame_size_buf)?;
    let min_frame_size = u32::from_be_bytes([0, frame_size_buf[0], frame_size_buf[1], frame_size_buf[2]]);
    let max_frame_size = u32::from_be_bytes([0, frame_size_buf[3], frame_size_buf[4], frame_size_buf[5]]);

    // 20-bit sample rate, 3-bit (channels - 1), 5-bit (bits_per_sample - 1),
    // 36-bit total sample count, packed across 8 bytes.
    let mut packed = [0u8; 8];
    stream.read_exact(&mut packed)?;
    let sample_rate = (u32::from(packed[0]) << 12) | (u32::from(packed[1]) << 4) | (u32::from(packed[2]) >> 4);
    let channels = ((packed[2] >> 1) & 0x07) + 1;
    let bits_per_sample = (((packed[2] & 0x01) << 4) | (packed[3] >> 4)) + 1;
    let total_samples = (u64::from(packed[3] & 0x0F) << 32)
        | (u64::from(packed[4]) << 24)
        | (u64::from(packed[5]) << 16)
        | (u64::from(packed[6]) << 8)
        | u64::from(packed[7]);

    let mut md5 = [0u8; 16];
    stream.read_exact(&mut md5)?;

    if length > 34 {
        stream.seek(i64::from(length - 34), Whence::Current)?;
    }

    Ok(StreamInfoBlock {
        min_block_size,
        max_block_size,
        min_frame_size,
        max_frame_size,
        sample_rate,
        channels,
        bits_per_sample,
        total_samples,
        md5,
    })
}

pub(super) fn parse_seektable(stream: &mut dyn ByteStream, length: u32) -> Result<Vec<SeekPoint>> {
    let count = (length / 18).min(MAX_SEEKPOINTS as u32);
    let mut points = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let sample_number = stream.read_u64_be()?;
        let stream_offset = stream.read_u64_be()?;
        let frame_samples = stream.read_u16_be()?;
        if sample_number != SEEKPOINT_PLACEHOLDER {
            points.push(SeekPoint { sample_number, stream_offset, frame_samples });
        }
    }
    let consumed = u64::from(count) * 18;
    if u64::from(length) > consumed {
        stream.seek((u64::from(length) - consumed) as i64, Whence::Current)?;
    }
    Ok(points)
}

pub(super) fn parse_vorbis_comment(stream: &mut dyn ByteStream, length: u32, tags: &mut Tags) -> Result<()> {
    let capped = u64::from(length).min(MAX_COMMENT_BLOCK_BYTES);
    let mut body = vec![0u8; capped as usize];
    stream.read_exact(&mut body)?;
    if u64::from(length) > capped {
        stream.seek((u64::from(length) - capped) as i64, Whence::Current)?;
    }
    tag::parse_vorbis_comment(&body, tags)?;
    Ok(())
}

/// `PADDING`/`APPLICATION`/`CUESHEET` are skipped by declared length.
/// `PICTURE` is skipped too: this demultiplexer surfaces audio streams, not
/// attached art, but still bounds the skip so a corrupt declared length
/// cannot seek arbitrarily far forward.
pub(super) fn skip_block(stream: &mut dyn ByteStream, block_type: u8, length: u32, recovery: &RecoveryStats) -> Result<()> {
    let cap = if block_type == BLOCK_PICTURE { MAX_PICTURE_BYTES } else { u64::MAX };
    let skip = u64::from(length).min(cap);
    if skip < u64::from(length) {
        recovery.record_clamped_size();
    }
    stream.seek(skip as i64, Whence::Current)?;
    Ok(())
}
