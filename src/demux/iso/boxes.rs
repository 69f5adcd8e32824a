//! ISO/IEC 14496-12 box header framing: 32-bit size + FourCC, with the
//! 64-bit extended-size and extends-to-EOF variants, plus bounded recovery
//! when a declared size cannot be trusted.

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::RecoveryStats;
use crate::error::{Error, Result};

/// Scan window used to recover from an invalid box size by looking for the
/// next plausible FourCC, per the specification's 1 KiB recovery bound.
const RESYNC_WINDOW: usize = 1024;

const KNOWN_BOX_TYPES: &[[u8; 4]] = &[
    *b"ftyp", *b"moov", *b"mvhd", *b"trak", *b"tkhd", *b"mdia", *b"mdhd", *b"hdlr", *b"minf",
    *b"stbl", *b"stsd", *b"stts", *b"stsc", *b"stsz", *b"stz2", *b"stco", *b"co64", *b"stss",
    *b"ctts", *b"edts", *b"elst", *b"dinf", *b"udta", *b"meta", *b"ilst", *b"mdat", *b"moof",
    *b"mfra", *b"mfhd", *b"traf", *b"tfhd", *b"trun", *b"tfdt", *b"free", *b"skip", *b"wide",
    *b"smhd", *b"vmhd", *b"dref",
];

/// One box header: its FourCC, the absolute start offset of the header
/// itself, the header's own length (8 or 16 bytes), and the payload length
/// that follows it.
#[derive(Clone, Copy, Debug)]
pub(super) struct BoxHeader {
    pub box_type: [u8; 4],
    pub start: u64,
    pub header_len: u64,
    pub payload_len: u64,
}

impl BoxHeader {
    pub(super) fn end(&self) -> u64 {
        self.start + self.header_len + self.payload_len
    }

    pub(super) fn is(&self, fourcc: &[u8; 4]) -> bool {
        &self.box_type == fourcc
    }
}

/// Reads one box header at the stream's current position. `container_end`
/// bounds a `size == 0` ("extends to end of container") box; clamps an
/// oversize declared length to what remains, recording a recovery event.
pub(super) fn read_box_header(
    stream: &mut dyn ByteStream,
    container_end: u64,
    recovery: &RecoveryStats,
) -> Result<BoxHeader> {
    let start = stream.tell();
    let size32 = stream.read_u32_be()?;
    let box_type = stream.read_fourcc()?;

    let (header_len, total_size) = if size32 == 1 {
        let size64 = stream.read_u64_be()?;
        (16u64, size64)
    } else if size32 == 0 {
        (8u64, container_end.saturating_sub(start))
    } else {
        (8u64, u64::from(size32))
    };

    if total_size < header_len {
        return Err(Error::format("box declares a size smaller than its own header"));
    }

    let remaining = container_end.saturating_sub(start);
    let clamped_total = if total_size > remaining {
        recovery.record_clamped_size();
        remaining
    } else {
        total_size
    };

    Ok(BoxHeader {
        box_type,
        start,
        header_len,
        payload_len: clamped_total - header_len,
    })
}

/// Scans forward up to [`RESYNC_WINDOW`] bytes for a recognisable box type,
/// after a box header failed to parse or declared an impossible size.
pub(super) fn resync(stream: &mut dyn ByteStream, container_end: u64, recovery: &RecoveryStats) -> Result<bool> {
    recovery.record_skipped_unknown();
    let start = stream.tell();
    let limit = RESYNC_WINDOW.min(container_end.saturating_sub(start) as usize);
    if limit < 8 {
        return Ok(false);
    }
    let mut window = vec![0u8; limit];
    let n = stream.read(&mut window)?;
    for i in 0..n.saturating_sub(8).saturating_add(1) {
        if i + 8 > n {
            break;
        }
        let candidate: [u8; 4] = window[i + 4..i + 8].try_into().expect("4 bytes");
        if KNOWN_BOX_TYPES.iter().any(|t| *t == candidate) {
            stream.seek((start + i as u64) as i64, Whence::Start)?;
            return Ok(true);
        }
    }
    stream.seek(start as i64, Whence::Start)?;
    Ok(false)
}
