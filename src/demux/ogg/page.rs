//! Ogg page framing (RFC 3533 §6): capture pattern, lacing/segment table,
//! and packet reassembly across page boundaries.

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::RecoveryStats;
use crate::error::Result;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const RESYNC_WINDOW: usize = 8192;
const GRANULE_CONTINUATION: u64 = u64::MAX;

#[derive(Clone, Debug)]
pub(super) struct OggPage {
    pub continued: bool,
    pub first: bool,
    pub last: bool,
    pub granule: u64,
    pub serial: u32,
    pub sequence: u32,
    pub segment_table: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Reads one page starting at the stream's current position. If the
/// capture pattern is not found there, scans forward in bounded windows
/// (recording a recovery event) until one is found or EOF is reached.
pub(super) fn read_page(stream: &mut dyn ByteStream, recovery: &RecoveryStats) -> Result<Option<OggPage>> {
    if !resync_to_capture(stream, recovery)? {
        return Ok(None);
    }

    let mut header = [0u8; 23];
    stream.read_exact(&mut header)?;
    // header[0] = stream_structure_version, header[1] = header_type_flag
    let header_type = header[1];
    let granule = u64::from_le_bytes(header[2..10].try_into().expect("8 bytes"));
    let serial = u32::from_le_bytes(header[10..14].try_into().expect("4 bytes"));
    let sequence = u32::from_le_bytes(header[14..18].try_into().expect("4 bytes"));
    let _crc = u32::from_le_bytes(header[18..22].try_into().expect("4 bytes"));
    let page_segments = header[22] as usize;

    let mut segment_table = vec![0u8; page_segments];
    stream.read_exact(&mut segment_table)?;
    let payload_len: usize = segment_table.iter().map(|&b| b as usize).sum();
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload)?;

    Ok(Some(OggPage {
        continued: header_type & 0x01 != 0,
        first: header_type & 0x02 != 0,
        last: header_type & 0x04 != 0,
        granule,
        serial,
        sequence,
        segment_table,
        payload,
    }))
}

fn resync_to_capture(stream: &mut dyn ByteStream, recovery: &RecoveryStats) -> Result<bool> {
    let mut probe = [0u8; 4];
    let start = stream.tell();
    match stream.read(&mut probe) {
        Ok(4) if &probe == CAPTURE_PATTERN => return Ok(true),
        Ok(0) => return Ok(false),
        _ => {}
    }
    stream.seek(start as i64, Whence::Start)?;
    if stream.eof() {
        return Ok(false);
    }

    recovery.record_skipped_unknown();
    let mut window = vec![0u8; RESYNC_WINDOW];
    loop {
        let pos = stream.tell();
        let n = stream.read(&mut window)?;
        if n < 4 {
            return Ok(false);
        }
        for i in 0..=n - 4 {
            if &window[i..i + 4] == CAPTURE_PATTERN {
                stream.seek((pos + i as u64) as i64, Whence::Start)?;
                return Ok(true);
            }
        }
        stream.seek(pos as i64 + n as i64 - 3, Whence::Start)?;
    }
}

/// Splits a page's payload into packets per the lacing values in
/// `segment_table`. Returns completed packets plus, if the page ends
/// mid-packet (final lacing value is `255`), the trailing partial bytes for
/// the caller to carry over into the next page for this serial.
pub(super) fn split_packets(segment_table: &[u8], payload: &[u8]) -> (Vec<Vec<u8>>, Option<Vec<u8>>) {
    let mut packets = Vec::new();
    let mut current = Vec::new();
    let mut pos = 0usize;

    for (i, &lacing) in segment_table.iter().enumerate() {
        let len = lacing as usize;
        current.extend_from_slice(&payload[pos..pos + len]);
        pos += len;
        if lacing < 255 {
            packets.push(std::mem::take(&mut current));
        } else if i + 1 == segment_table.len() {
            return (packets, Some(current));
        }
    }
    (packets, None)
}

pub(super) fn is_sentinel_granule(granule: u64) -> bool {
    granule == GRANULE_CONTINUATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_packets_handles_single_complete_packet() {
        let (packets, partial) = split_packets(&[5], b"hello");
        assert_eq!(packets, vec![b"hello".to_vec()]);
        assert!(partial.is_none());
    }

    #[test]
    fn split_packets_carries_over_continuation() {
        let (packets, partial) = split_packets(&[255, 10], &[0u8; 265]);
        assert!(packets.is_empty());
        assert_eq!(partial.unwrap().len(), 265);
    }

    #[test]
    fn split_packets_terminates_exact_255_multiple() {
        let (packets, partial) = split_packets(&[255, 0], &[0u8; 255]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 255);
        assert!(partial.is_none());
    }
}
