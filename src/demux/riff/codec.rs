//! WAVE format-tag and AIFC compression-type to codec-name mapping.

pub(super) fn wave_codec_name(format_tag: u16) -> &'static str {
    match format_tag {
        0x0001 | 0x0003 | 0xFFFE => "pcm",
        0x0006 => "alaw",
        0x0007 => "mulaw",
        0x0055 => "mp3",
        0x0002 | 0x0011 => "adpcm",
        _ => "unknown",
    }
}

pub(super) fn aifc_codec_name(compression: &[u8; 4]) -> &'static str {
    match compression {
        b"NONE" | b"sowt" | b"fl32" | b"fl64" => "pcm",
        b"alaw" => "alaw",
        b"ulaw" => "mulaw",
        _ => "unknown",
    }
}
