//! Ogg demultiplexer (RFC 3533/3534): page framing plus the Vorbis, Opus,
//! Ogg-FLAC, and Speex logical-bitstream mappings.
//!
//! Each logical bitstream (identified by its page serial number) starts with
//! a run of header packets, a fixed count per codec, before audio packets
//! begin. This walks the whole file once after the header packets are
//! consumed, recording a sparse per-stream granule index (the same
//! index-then-`partition_point` idiom as the native FLAC demuxer) so that
//! `seek_to` never has to guess at raw byte offsets.

mod codec;
mod page;

use std::collections::{BTreeMap, VecDeque};

use crate::bytestream::{ByteStream, Whence};
use crate::demux::ogg::codec::{Codec, IdentHeader};
use crate::demux::ogg::page::OggPage;
use crate::demux::{tag, CodecType, Demuxer, MediaChunk, RecoveryStats, StreamInfo, Tags};
use crate::error::{Error, Result};

const MAX_LOGICAL_STREAMS: usize = 64;
const MIN_INDEX_SPACING_MS: i64 = 1_000;
const MAX_INDEX_ENTRIES: usize = 50_000;
const TAIL_SCAN_WINDOW: u64 = 1024 * 1024;

const FLAC_BLOCK_VORBIS_COMMENT: u8 = 4;

struct SeekIndexEntry {
    granule: u64,
    offset: u64,
}

struct LogicalStream {
    serial: u32,
    codec: Codec,
    headers_required: u32,
    headers_seen: u32,
    pending: Option<Vec<u8>>,
    ident: IdentHeader,
    tags: Tags,
    codec_private: Vec<u8>,
    last_granule: u64,
    seen_granule: bool,
    index: Vec<SeekIndexEntry>,
    last_index_ms: i64,
    /// Raw header packets, in arrival order, cached for replay: a decoder
    /// needs them again every time playback restarts from the beginning.
    header_packets: Vec<Vec<u8>>,
}

impl LogicalStream {
    fn new(serial: u32, codec: Codec) -> Self {
        Self {
            serial,
            codec,
            headers_required: codec.required_header_packets(),
            headers_seen: 0,
            pending: None,
            ident: IdentHeader::default(),
            tags: Tags::default(),
            codec_private: Vec::new(),
            last_granule: 0,
            seen_granule: false,
            index: Vec::new(),
            last_index_ms: -MIN_INDEX_SPACING_MS,
            header_packets: Vec::new(),
        }
    }

    fn needs_headers(&self) -> bool {
        self.headers_seen < self.headers_required
    }

    /// Feeds one reassembled packet belonging to this stream, dispatching to
    /// header parsing while any remain, otherwise queuing it as audio.
    fn ingest_packet(&mut self, packet: Vec<u8>, audio: &mut Vec<(u32, u64, Vec<u8>)>) {
        if self.needs_headers() {
            self.header_packets.push(packet.clone());
            self.parse_header_packet(&packet);
            self.headers_seen += 1;
        } else {
            audio.push((self.serial, self.last_granule, packet));
        }
    }

    fn parse_header_packet(&mut self, packet: &[u8]) {
        match self.codec {
            Codec::Vorbis => {
                if self.headers_seen == 0 {
                    if let Some(ident) = codec::parse_vorbis_ident(packet) {
                        self.ident = ident;
                    }
                } else if self.headers_seen == 1 && packet.len() > 7 {
                    let _ = tag::parse_vorbis_comment(&packet[7..], &mut self.tags);
                }
                self.codec_private.extend_from_slice(packet);
            }
            Codec::Opus => {
                if self.headers_seen == 0 {
                    if let Some(ident) = codec::parse_opus_head(packet) {
                        self.ident = ident;
                    }
                    self.codec_private = packet.to_vec();
                } else if self.headers_seen == 1 && packet.len() > 8 {
                    let _ = tag::parse_vorbis_comment(&packet[8..], &mut self.tags);
                }
            }
            Codec::Speex => {
                if self.headers_seen == 0 {
                    if let Some(ident) = codec::parse_speex_header(packet) {
                        self.ident = ident;
                    }
                    self.codec_private = packet.to_vec();
                }
            }
            Codec::OggFlac => {
                if self.headers_seen == 0 {
                    if let Some(ident) = codec::parse_ogg_flac_header(packet) {
                        self.headers_required = 1 + u32::from(header_count(packet));
                        self.codec_private = packet[17..17 + 34].to_vec();
                        self.ident = ident;
                    }
                } else if let Some((block_type, body)) = split_flac_metadata_block(packet) {
                    if block_type == FLAC_BLOCK_VORBIS_COMMENT {
                        let _ = tag::parse_vorbis_comment(body, &mut self.tags);
                    }
                }
            }
        }
    }

    fn samples_from_granule(&self, granule: u64) -> u64 {
        match self.codec {
            Codec::Opus => granule.saturating_sub(u64::from(self.ident.pre_skip)),
            _ => granule,
        }
    }

    fn timestamp_ms(&self, granule: u64) -> u64 {
        if self.ident.sample_rate == 0 {
            return 0;
        }
        self.samples_from_granule(granule) * 1000 / u64::from(self.ident.sample_rate)
    }
}

/// Reads the 16-bit big-endian "number of header packets" field of an
/// Ogg-FLAC identification packet (not including the ident packet itself).
fn header_count(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[7], packet[8]])
}

/// Splits a native FLAC metadata-block packet (as carried, whole, inside the
/// Ogg-FLAC mapping) into its block type and body, without reaching into the
/// native FLAC demuxer's private block-header parsing.
fn split_flac_metadata_block(packet: &[u8]) -> Option<(u8, &[u8])> {
    if packet.len() < 4 {
        return None;
    }
    let block_type = packet[0] & 0x7F;
    let length = ((u32::from(packet[1]) << 16) | (u32::from(packet[2]) << 8) | u32::from(packet[3])) as usize;
    let body = packet.get(4..4 + length)?;
    Some((block_type, body))
}

/// Demultiplexer for Ogg-framed Vorbis, Opus, Ogg-FLAC, and Speex streams.
pub struct OggDemuxer {
    stream: Box<dyn ByteStream>,
    streams: BTreeMap<u32, LogicalStream>,
    order: Vec<u32>,
    stream_infos: Vec<StreamInfo>,
    data_start_offset: u64,
    pending: VecDeque<MediaChunk>,
    eof: bool,
    position_ms: u64,
    duration_ms: u64,
    recovery: RecoveryStats,
}

impl OggDemuxer {
    #[must_use]
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            streams: BTreeMap::new(),
            order: Vec::new(),
            stream_infos: Vec::new(),
            data_start_offset: 0,
            pending: VecDeque::new(),
            eof: false,
            position_ms: 0,
            duration_ms: 0,
            recovery: RecoveryStats::default(),
        }
    }

    /// Reads and ingests pages until every logical stream seen so far has
    /// consumed all of its header packets. Returns the byte offset at which
    /// audio packets begin.
    fn parse_headers(&mut self) -> Result<u64> {
        let mut scratch_audio = Vec::new();
        loop {
            let page_offset = self.stream.tell();
            let Some(page) = page::read_page(&mut *self.stream, &self.recovery)? else {
                return Err(Error::format("end of stream before Ogg header packets completed"));
            };

            if page.first {
                if !self.streams.contains_key(&page.serial) {
                    if self.streams.len() >= MAX_LOGICAL_STREAMS {
                        self.recovery.record_skipped_unknown();
                    } else {
                        let (packets, _) = page::split_packets(&page.segment_table, &page.payload);
                        let Some(first_packet) = packets.first() else {
                            return Err(Error::format("beginning-of-stream page carries no packet"));
                        };
                        let Some(codec) = codec::identify(first_packet) else {
                            return Err(Error::format("unrecognised Ogg logical-bitstream mapping"));
                        };
                        self.order.push(page.serial);
                        self.streams.insert(page.serial, LogicalStream::new(page.serial, codec));
                    }
                }
            }

            self.ingest_page(&page, page_offset, &mut scratch_audio);

            if self.streams.values().all(|s| !s.needs_headers()) && !self.streams.is_empty() {
                return Ok(self.stream.tell());
            }
        }
    }

    fn ingest_page(&mut self, page: &OggPage, page_offset: u64, audio_out: &mut Vec<(u32, u64, Vec<u8>)>) {
        let Some(logical) = self.streams.get_mut(&page.serial) else {
            self.recovery.record_skipped_unknown();
            return;
        };

        let (mut packets, partial) = page::split_packets(&page.segment_table, &page.payload);

        if let Some(carried) = logical.pending.take() {
            if let Some(first) = packets.first_mut() {
                let mut combined = carried;
                combined.extend_from_slice(first);
                *first = combined;
            } else if let Some(tail) = &partial {
                let mut combined = carried;
                combined.extend_from_slice(tail);
                logical.pending = Some(combined);
                if !page::is_sentinel_granule(page.granule) {
                    logical.last_granule = page.granule;
                    logical.seen_granule = true;
                }
                return;
            } else {
                logical.pending = Some(carried);
            }
        }

        for packet in packets {
            logical.ingest_packet(packet, audio_out);
        }
        logical.pending = partial;

        if !page::is_sentinel_granule(page.granule) {
            logical.last_granule = page.granule;
            logical.seen_granule = true;
        }

        for (serial, _, packet) in audio_out.drain(..) {
            let timestamp_ms = logical.timestamp_ms(page.granule);
            self.pending.push_back(MediaChunk {
                stream_id: serial,
                data: packet,
                granule: page.granule,
                timestamp_ms,
                keyframe: true,
                file_offset: page_offset,
            });
        }
    }

    /// Walks every page from `data_start_offset` to end-of-file, recording a
    /// sparse granule index per stream and the terminal granule reached.
    fn build_page_index(&mut self) -> Result<()> {
        self.stream.seek(self.data_start_offset as i64, Whence::Start)?;
        loop {
            let offset = self.stream.tell();
            let page = match page::read_page(&mut *self.stream, &self.recovery)? {
                Some(p) => p,
                None => break,
            };
            let Some(logical) = self.streams.get_mut(&page.serial) else {
                self.recovery.record_skipped_unknown();
                continue;
            };
            if page::is_sentinel_granule(page.granule) {
                continue;
            }
            logical.last_granule = page.granule;
            logical.seen_granule = true;
            let ms = logical.timestamp_ms(page.granule) as i64;
            if logical.index.len() < MAX_INDEX_ENTRIES && ms - logical.last_index_ms >= MIN_INDEX_SPACING_MS {
                logical.index.push(SeekIndexEntry { granule: page.granule, offset });
                logical.last_index_ms = ms;
            }
        }
        Ok(())
    }

    /// Scans the last [`TAIL_SCAN_WINDOW`] bytes of the file for the final
    /// page belonging to `serial`, used only when the forward index scan
    /// never observed a non-sentinel granule for that stream.
    fn tail_scan_last_granule(&mut self, serial: u32) -> Result<Option<u64>> {
        let Some(size) = self.stream.size() else { return Ok(None) };
        let start = size.saturating_sub(TAIL_SCAN_WINDOW);
        self.stream.seek(start as i64, Whence::Start)?;
        let mut last = None;
        while let Some(page) = page::read_page(&mut *self.stream, &self.recovery)? {
            if page.serial == serial && !page::is_sentinel_granule(page.granule) {
                last = Some(page.granule);
            }
        }
        Ok(last)
    }

    fn primary_serial(&self) -> Option<u32> {
        self.order.first().copied()
    }

    /// Queues every logical stream's cached header packets, in registration
    /// order, so the next `read_chunk` calls replay them before audio —
    /// decoders need the header packets again whenever playback restarts
    /// from the beginning.
    fn enqueue_header_chunks(&mut self) {
        for &serial in &self.order {
            let Some(logical) = self.streams.get(&serial) else { continue };
            for packet in &logical.header_packets {
                self.pending.push_back(MediaChunk {
                    stream_id: serial,
                    data: packet.clone(),
                    granule: 0,
                    timestamp_ms: 0,
                    keyframe: true,
                    file_offset: self.data_start_offset,
                });
            }
        }
    }
}

impl Demuxer for OggDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if !self.stream_infos.is_empty() {
            return Ok(());
        }

        self.stream.seek(0, Whence::Start)?;
        self.data_start_offset = self.parse_headers()?;
        self.pending.clear();
        self.build_page_index()?;

        for &serial in &self.order {
            let logical = self.streams.get_mut(&serial).expect("registered during header parse");
            let total_samples = if logical.ident.total_samples > 0 {
                logical.ident.total_samples
            } else if logical.seen_granule {
                logical.samples_from_granule(logical.last_granule)
            } else {
                0
            };
            let total_samples = if total_samples == 0 {
                self.tail_scan_last_granule(serial)?.map_or(0, |g| logical.samples_from_granule(g))
            } else {
                total_samples
            };
            let duration_ms = if logical.ident.sample_rate > 0 {
                total_samples * 1000 / u64::from(logical.ident.sample_rate)
            } else {
                0
            };
            self.duration_ms = self.duration_ms.max(duration_ms);

            self.stream_infos.push(StreamInfo {
                stream_id: serial,
                codec_type: CodecType::Audio,
                codec_name: logical.codec.name(),
                codec_tag: 0,
                sample_rate: logical.ident.sample_rate,
                channels: logical.ident.channels,
                bits_per_sample: logical.ident.bits_per_sample,
                nominal_bitrate: logical.ident.nominal_bitrate,
                codec_private: std::mem::take(&mut logical.codec_private),
                total_samples,
                duration_ms,
                tags: std::mem::take(&mut logical.tags),
            });
        }

        self.stream.seek(self.data_start_offset as i64, Whence::Start)?;
        for logical in self.streams.values_mut() {
            logical.pending = None;
        }
        self.enqueue_header_chunks();
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.stream_infos
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                self.position_ms = chunk.timestamp_ms;
                return Ok(chunk);
            }
            if self.eof {
                return Ok(MediaChunk::eof(0));
            }
            let page_offset = self.stream.tell();
            let mut scratch_audio = Vec::new();
            match page::read_page(&mut *self.stream, &self.recovery)? {
                Some(page) => {
                    self.ingest_page(&page, page_offset, &mut scratch_audio);
                }
                None => {
                    self.eof = true;
                }
            }
        }
    }

    fn read_chunk_for(&mut self, id: u32) -> Result<MediaChunk> {
        loop {
            if let Some(pos) = self.pending.iter().position(|c| c.stream_id == id) {
                let chunk = self.pending.remove(pos).expect("position just found");
                self.position_ms = self.position_ms.max(chunk.timestamp_ms);
                return Ok(chunk);
            }
            if self.eof {
                return Ok(MediaChunk::eof(id));
            }
            let page_offset = self.stream.tell();
            let mut scratch_audio = Vec::new();
            match page::read_page(&mut *self.stream, &self.recovery)? {
                Some(page) => self.ingest_page(&page, page_offset, &mut scratch_audio),
                None => self.eof = true,
            }
        }
    }

    fn seek_to(&mut self, ms: u64) -> Result<()> {
        let Some(serial) = self.primary_serial() else {
            return Err(Error::logic("parse_container not yet successful"));
        };
        let offset = {
            let logical = self.streams.get(&serial).expect("primary serial is registered");
            let target_sample = if logical.ident.sample_rate > 0 {
                ms * u64::from(logical.ident.sample_rate) / 1000
            } else {
                0
            };
            let target_granule = match logical.codec {
                Codec::Opus => target_sample + u64::from(logical.ident.pre_skip),
                _ => target_sample,
            };
            let idx = logical.index.partition_point(|e| e.granule <= target_granule);
            if idx > 0 {
                logical.index[idx - 1].offset
            } else {
                self.data_start_offset
            }
        };

        self.stream.seek(offset as i64, Whence::Start)?;
        for logical in self.streams.values_mut() {
            logical.pending = None;
        }
        self.pending.clear();
        self.eof = false;
        self.position_ms = ms;
        if ms == 0 {
            self.enqueue_header_chunks();
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn position_ms(&self) -> u64 {
        self.position_ms
    }

    fn granule_position(&self, id: u32) -> u64 {
        self.streams.get(&id).map_or(0, |s| s.last_granule)
    }

    fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    fn crc32(_bytes: &[u8]) -> u32 {
        // Page CRC is not validated by this demuxer (§ Non-goals); emit 0.
        0
    }

    fn build_page(serial: u32, sequence: u32, granule: u64, first: bool, last: bool, packets: &[&[u8]]) -> Vec<u8> {
        let mut segment_table = Vec::new();
        let mut payload = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            if remaining == 0 {
                segment_table.push(0);
            }
            while remaining >= 255 {
                segment_table.push(255);
                remaining -= 255;
            }
            segment_table.push(remaining as u8);
            payload.extend_from_slice(packet);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0); // version
        let mut header_type = 0u8;
        if first {
            header_type |= 0x02;
        }
        if last {
            header_type |= 0x04;
        }
        out.push(header_type);
        out.extend_from_slice(&granule.to_le_bytes());
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&crc32(&[]).to_le_bytes());
        out.push(segment_table.len() as u8);
        out.extend_from_slice(&segment_table);
        out.extend_from_slice(&payload);
        out
    }

    fn build_opus_stream() -> Vec<u8> {
        let mut head = b"OpusHead".to_vec();
        head.push(1); // version
        head.push(2); // channels
        head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes());
        head.push(0);

        let mut tags = b"OpusTags".to_vec();
        tags.extend_from_slice(&0u32.to_le_bytes()); // vendor length
        tags.extend_from_slice(&0u32.to_le_bytes()); // comment count

        let mut out = Vec::new();
        out.extend_from_slice(&build_page(1, 0, 0, true, false, &[&head]));
        out.extend_from_slice(&build_page(1, 1, 0, false, false, &[&tags]));
        out.extend_from_slice(&build_page(1, 2, 960, false, true, &[&[0u8; 10]]));
        out
    }

    #[test]
    fn parses_opus_stream_and_reads_one_packet() {
        let bytes = build_opus_stream();
        let mut demux = OggDemuxer::new(Box::new(MemoryStream::new(bytes)));
        demux.parse_container().unwrap();
        let info = &demux.streams()[0];
        assert_eq!(info.codec_name, "opus");
        assert_eq!(info.sample_rate, 48_000);
        assert_eq!(info.channels, 2);

        let head = demux.read_chunk().unwrap();
        assert!(head.data.starts_with(b"OpusHead"));
        let tags = demux.read_chunk().unwrap();
        assert!(tags.data.starts_with(b"OpusTags"));

        let chunk = demux.read_chunk().unwrap();
        assert!(!chunk.is_eof());
        assert_eq!(chunk.data.len(), 10);

        let eof_chunk = demux.read_chunk().unwrap();
        assert!(eof_chunk.is_eof());
    }

    #[test]
    fn seek_to_zero_is_always_possible() {
        let bytes = build_opus_stream();
        let mut demux = OggDemuxer::new(Box::new(MemoryStream::new(bytes)));
        demux.parse_container().unwrap();
        demux.seek_to(0).unwrap();
        assert_eq!(demux.position_ms(), 0);
    }
}
