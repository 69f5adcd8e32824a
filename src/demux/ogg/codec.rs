//! Logical-bitstream codec identification from the first packet of a
//! chain, and the minimal identification-header fields each mapping
//! exposes to [`crate::demux::StreamInfo`].

const VORBIS_SIGNATURE: &[u8] = b"\x01vorbis";
const OGG_FLAC_SIGNATURE: &[u8] = b"\x7FFLAC";
const OPUS_SIGNATURE: &[u8] = b"OpusHead";
const SPEEX_SIGNATURE: &[u8] = b"Speex   ";

const FLAC_NATIVE_SIGNATURE: &[u8; 4] = b"fLaC";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Codec {
    Vorbis,
    OggFlac,
    Opus,
    Speex,
}

impl Codec {
    /// Number of header (non-audio) packets this mapping defines, including
    /// the identification packet already consumed to identify it.
    pub(super) fn required_header_packets(self) -> u32 {
        match self {
            Codec::Vorbis => 3,
            Codec::OggFlac => 1,
            Codec::Opus => 2,
            Codec::Speex => 1,
        }
    }

    pub(super) fn name(self) -> &'static str {
        match self {
            Codec::Vorbis => "vorbis",
            Codec::OggFlac => "flac",
            Codec::Opus => "opus",
            Codec::Speex => "speex",
        }
    }
}

/// Identifies a logical bitstream's codec from its first page's first
/// packet (the RFC 3533 "beginning of stream" packet).
pub(super) fn identify(first_packet: &[u8]) -> Option<Codec> {
    if first_packet.starts_with(VORBIS_SIGNATURE) {
        Some(Codec::Vorbis)
    } else if first_packet.starts_with(OGG_FLAC_SIGNATURE) {
        Some(Codec::OggFlac)
    } else if first_packet.starts_with(OPUS_SIGNATURE) {
        Some(Codec::Opus)
    } else if first_packet.starts_with(SPEEX_SIGNATURE) {
        Some(Codec::Speex)
    } else {
        None
    }
}

/// Decoded identification-header fields common to every mapping.
#[derive(Clone, Debug, Default)]
pub(super) struct IdentHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub nominal_bitrate: u32,
    pub pre_skip: u32,
    pub total_samples: u64,
}

pub(super) fn parse_vorbis_ident(packet: &[u8]) -> Option<IdentHeader> {
    if packet.len() < 30 {
        return None;
    }
    let channels = packet[11];
    let sample_rate = u32::from_le_bytes(packet[12..16].try_into().ok()?);
    let nominal_bitrate = u32::from_le_bytes(packet[20..24].try_into().ok()?);
    Some(IdentHeader {
        sample_rate,
        channels: u16::from(channels),
        bits_per_sample: 0,
        nominal_bitrate,
        pre_skip: 0,
        total_samples: 0,
    })
}

pub(super) fn parse_opus_head(packet: &[u8]) -> Option<IdentHeader> {
    if packet.len() < 19 {
        return None;
    }
    let channels = packet[9];
    let pre_skip = u16::from_le_bytes(packet[10..12].try_into().ok()?);
    Some(IdentHeader {
        // Opus always decodes at a fixed 48kHz internal rate; the input
        // sample rate at bytes 12..16 is informational only.
        sample_rate: 48_000,
        channels: u16::from(channels),
        bits_per_sample: 0,
        nominal_bitrate: 0,
        pre_skip: u32::from(pre_skip),
        total_samples: 0,
    })
}

/// The Speex header is a fixed 80-byte C struct; only the fields this
/// demultiplexer needs are extracted.
pub(super) fn parse_speex_header(packet: &[u8]) -> Option<IdentHeader> {
    if packet.len() < 80 {
        return None;
    }
    let rate = i32::from_le_bytes(packet[36..40].try_into().ok()?);
    let channels = i32::from_le_bytes(packet[48..52].try_into().ok()?);
    let bitrate = i32::from_le_bytes(packet[52..56].try_into().ok()?);
    Some(IdentHeader {
        sample_rate: rate.max(0) as u32,
        channels: u16::try_from(channels.max(1)).unwrap_or(1),
        bits_per_sample: 0,
        nominal_bitrate: bitrate.max(0) as u32,
        pre_skip: 0,
        total_samples: 0,
    })
}

/// The Ogg-FLAC mapping header: `0x7F` + `"FLAC"` + major/minor version +
/// a 16-bit header-packet count + the native `"fLaC"` signature + a native
/// `STREAMINFO` metadata block (4-byte block header + 34-byte body).
pub(super) fn parse_ogg_flac_header(packet: &[u8]) -> Option<IdentHeader> {
    if packet.len() < 9 + 4 + 4 + 34 {
        return None;
    }
    if &packet[9..13] != FLAC_NATIVE_SIGNATURE {
        return None;
    }
    let block_type = packet[13] & 0x7F;
    if block_type != 0 {
        return None;
    }
    let body = &packet[17..17 + 34];

    let sample_rate = (u32::from(body[10]) << 12) | (u32::from(body[11]) << 4) | (u32::from(body[12]) >> 4);
    let channels = ((body[12] >> 1) & 0x07) + 1;
    let bits_per_sample = (((body[12] & 0x01) << 4) | (body[13] >> 4)) + 1;
    let total_samples = (u64::from(body[13] & 0x0F) << 32)
        | (u64::from(body[14]) << 24)
        | (u64::from(body[15]) << 16)
        | (u64::from(body[16]) << 8)
        | u64::from(body[17]);

    Some(IdentHeader {
        sample_rate,
        channels: u16::from(channels),
        bits_per_sample: u16::from(bits_per_sample),
        nominal_bitrate: 0,
        pre_skip: 0,
        total_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_opus_by_signature() {
        let mut packet = b"OpusHead".to_vec();
        packet.extend_from_slice(&[0u8; 11]);
        assert_eq!(identify(&packet), Some(Codec::Opus));
    }

    #[test]
    fn unrecognised_signature_returns_none() {
        assert_eq!(identify(b"whatever"), None);
    }

    #[test]
    fn parses_opus_head_fields() {
        let mut packet = b"OpusHead".to_vec();
        packet.push(1); // version
        packet.push(2); // channels
        packet.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
        packet.extend_from_slice(&48_000u32.to_le_bytes()); // input sample rate
        packet.extend_from_slice(&0u16.to_le_bytes()); // output gain
        packet.push(0); // channel mapping family
        let header = parse_opus_head(&packet).unwrap();
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.channels, 2);
        assert_eq!(header.pre_skip, 312);
    }
}
