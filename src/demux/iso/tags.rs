//! iTunes-style metadata (`udta/meta/ilst`): each `ilst` child's FourCC
//! identifies the tag, and a nested `data` atom carries its UTF-8 value.

use crate::bytestream::{ByteStream, Whence};
use crate::demux::io_ext::ReadExt;
use crate::demux::iso::boxes::{read_box_header, BoxHeader};
use crate::demux::{RecoveryStats, Tags};
use crate::error::Result;

/// Parses an `ilst` box's children into `tags`, recognising the common
/// artist/title/album atoms and ignoring the rest.
pub(super) fn parse_ilst(stream: &mut dyn ByteStream, ilst_end: u64, tags: &mut Tags, recovery: &RecoveryStats) -> Result<()> {
    while stream.tell() + 8 <= ilst_end {
        let item = match read_box_header(stream, ilst_end, recovery) {
            Ok(h) => h,
            Err(_) => break,
        };
        if let Some(value) = read_data_atom(stream, &item, recovery)? {
            match &item.box_type {
                b"\xa9nam" => tags.title = Some(value),
                b"\xa9ART" | b"aART" => tags.artist = Some(value),
                b"\xa9alb" => tags.album = Some(value),
                _ => {}
            }
        }
        stream.seek(item.end() as i64, Whence::Start)?;
    }
    Ok(())
}

/// Reads the single nested `data` atom inside an `ilst` item: an 8-byte
/// type-indicator/locale header followed by the raw value. Only text-typed
/// (`type == 1`) payloads are decoded; anything else (cover art, `trkn`
/// raw-byte counters) is skipped.
fn read_data_atom(stream: &mut dyn ByteStream, item: &BoxHeader, recovery: &RecoveryStats) -> Result<Option<String>> {
    let item_end = item.end();
    if stream.tell() + 8 > item_end {
        return Ok(None);
    }
    let data_header = read_box_header(stream, item_end, recovery)?;
    if !data_header.is(b"data") || data_header.payload_len < 8 {
        return Ok(None);
    }
    let type_indicator = stream.read_u32_be()?;
    let _locale = stream.read_u32_be()?;
    let value_len = (data_header.payload_len - 8) as usize;
    let value = if type_indicator == 1 {
        Some(stream.read_fixed_string(value_len)?)
    } else {
        stream.seek(value_len as i64, Whence::Current)?;
        None
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    fn build_ilst_entry(fourcc: &[u8; 4], text: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(text.as_bytes());
        let data_size = (8 + data.len()) as u32;

        let mut item = Vec::new();
        item.extend_from_slice(&data_size.to_be_bytes());
        item.extend_from_slice(b"data");
        item.extend_from_slice(&data);

        let entry_size = (8 + item.len()) as u32;
        let mut entry = Vec::new();
        entry.extend_from_slice(&entry_size.to_be_bytes());
        entry.extend_from_slice(fourcc);
        entry.extend_from_slice(&item);
        entry
    }

    #[test]
    fn parses_title_and_artist_atoms() {
        let mut bytes = build_ilst_entry(b"\xa9nam", "Song");
        bytes.extend_from_slice(&build_ilst_entry(b"\xa9ART", "Artist"));
        let len = bytes.len() as u64;
        let mut stream = MemoryStream::new(bytes);
        let recovery = RecoveryStats::default();
        let mut tags = Tags::default();
        parse_ilst(&mut stream, len, &mut tags, &recovery).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Song"));
        assert_eq!(tags.artist.as_deref(), Some("Artist"));
    }
}
