//! Shared Vorbis-comment grammar: vendor string, then N × `FIELD=VALUE`
//! entries. Used by the Ogg (Vorbis/Opus `*Tags` packets) and native FLAC
//! (`VORBIS_COMMENT` metadata block) demuxers alike.

use crate::demux::Tags;
use crate::error::{Error, Result};

const MAX_COMMENTS: usize = 1_000;
const MAX_COMMENT_BYTES: usize = 8 * 1024;

/// Parses a Vorbis-comment packet body (vendor string + comment list) and
/// folds recognised fields (`ARTIST`, `TITLE`, `ALBUM`) into `tags`.
///
/// Returns the full field list as `(name, value)` pairs, uppercased names,
/// for callers that want more than the three standard fields.
pub(crate) fn parse_vorbis_comment(body: &[u8], tags: &mut Tags) -> Result<Vec<(String, String)>> {
    let mut cursor = 0usize;
    let vendor_len = read_u32_le(body, &mut cursor)? as usize;
    if cursor + vendor_len > body.len() {
        return Err(Error::format("vorbis comment: vendor string exceeds packet"));
    }
    cursor += vendor_len;

    let count = read_u32_le(body, &mut cursor)? as usize;
    let mut fields = Vec::with_capacity(count.min(MAX_COMMENTS));

    for _ in 0..count.min(MAX_COMMENTS) {
        let len = read_u32_le(body, &mut cursor)? as usize;
        let len = len.min(MAX_COMMENT_BYTES);
        if cursor + len > body.len() {
            break;
        }
        let entry = &body[cursor..cursor + len];
        cursor += len;

        let text = String::from_utf8_lossy(entry);
        if let Some((name, value)) = text.split_once('=') {
            let name = name.to_ascii_uppercase();
            match name.as_str() {
                "ARTIST" => tags.artist.get_or_insert_with(|| value.to_string()),
                "TITLE" => tags.title.get_or_insert_with(|| value.to_string()),
                "ALBUM" => tags.album.get_or_insert_with(|| value.to_string()),
                _ => continue,
            };
            fields.push((name, value.to_string()));
        }
    }

    Ok(fields)
}

fn read_u32_le(body: &[u8], cursor: &mut usize) -> Result<u32> {
    if *cursor + 4 > body.len() {
        return Err(Error::format("vorbis comment: truncated length field"));
    }
    let bytes: [u8; 4] = body[*cursor..*cursor + 4].try_into().expect("checked length");
    *cursor += 4;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(vendor: &str, entries: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        out.extend_from_slice(vendor.as_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            out.extend_from_slice(entry.as_bytes());
        }
        out
    }

    #[test]
    fn populates_standard_fields_case_insensitively() {
        let body = encode("demux-core", &["artist=Test Artist", "TITLE=Test Title"]);
        let mut tags = Tags::default();
        parse_vorbis_comment(&body, &mut tags).unwrap();
        assert_eq!(tags.artist.as_deref(), Some("Test Artist"));
        assert_eq!(tags.title.as_deref(), Some("Test Title"));
    }
}
