//! End-to-end scenarios: one handcrafted fixture per container family,
//! driven purely through the public `factory`/`Demuxer` surface.

use demux_core::bytestream::MemoryStream;
use demux_core::config::{Config, CrcValidation};
use demux_core::demux::Demuxer;
use demux_core::factory;

fn be_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

// S1 — WAVE PCM 16-bit stereo 44.1 kHz, 2.000 s.
#[test]
fn s1_wave_pcm_stereo() {
    let pcm = vec![0u8; 352_800];
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    let riff_size = 4 + (8 + 16) + (8 + pcm.len() as u32);
    out.extend_from_slice(&riff_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&2u16.to_le_bytes()); // stereo
    out.extend_from_slice(&44_100u32.to_le_bytes());
    out.extend_from_slice(&176_400u32.to_le_bytes()); // avg bytes/sec
    out.extend_from_slice(&4u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(&pcm);

    let config = Config::default();
    let mut demux = factory::open(Box::new(MemoryStream::new(out)), Some("track.wav"), &config).unwrap();
    demux.parse_container().unwrap();

    assert_eq!(demux.streams().len(), 1);
    let info = &demux.streams()[0];
    assert_eq!(info.codec_name, "pcm");
    assert_eq!(info.channels, 2);
    assert_eq!(info.sample_rate, 44_100);
    assert_eq!(demux.duration_ms(), 2000);

    let mut total = 0usize;
    loop {
        let chunk = demux.read_chunk().unwrap();
        if chunk.is_eof() {
            break;
        }
        total += chunk.data.len();
    }
    assert_eq!(total, pcm.len());

    demux.seek_to(1000).unwrap();
    let chunk = demux.read_chunk().unwrap();
    assert!(!chunk.is_eof());
    assert!((999..=1001).contains(&chunk.timestamp_ms));
}

// S2 — AIFF mono 8-bit mulaw 8 kHz, 1.000 s.
#[test]
fn s2_aiff_mulaw_mono() {
    let samples = vec![0u8; 8000];

    let mut comm = Vec::new();
    comm.extend_from_slice(&1u16.to_be_bytes()); // channels
    comm.extend_from_slice(&(samples.len() as u32).to_be_bytes()); // sample frames
    comm.extend_from_slice(&8u16.to_be_bytes()); // bits per sample
    comm.extend_from_slice(&[0x40, 0x0B, 0xFA, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]); // 8000.0 IEEE-80
    comm.extend_from_slice(b"ulaw");

    let mut ssnd = Vec::new();
    ssnd.extend_from_slice(&0u32.to_be_bytes()); // offset
    ssnd.extend_from_slice(&0u32.to_be_bytes()); // block size
    ssnd.extend_from_slice(&samples);

    let mut out = Vec::new();
    out.extend_from_slice(b"FORM");
    let form_size = 4 + (8 + comm.len() as u32) + (8 + ssnd.len() as u32);
    out.extend_from_slice(&form_size.to_be_bytes());
    out.extend_from_slice(b"AIFC");
    out.extend_from_slice(b"COMM");
    out.extend_from_slice(&(comm.len() as u32).to_be_bytes());
    out.extend_from_slice(&comm);
    out.extend_from_slice(b"SSND");
    out.extend_from_slice(&(ssnd.len() as u32).to_be_bytes());
    out.extend_from_slice(&ssnd);

    let config = Config::default();
    let mut demux = factory::open(Box::new(MemoryStream::new(out)), Some("track.aiff"), &config).unwrap();
    demux.parse_container().unwrap();

    let info = &demux.streams()[0];
    assert_eq!(info.codec_name, "mulaw");
    assert_eq!(info.sample_rate, 8000);
    assert_eq!(info.channels, 1);
    assert_eq!(demux.duration_ms(), 1000);
}

// S3 — Ogg/Opus 48 kHz stereo 0.500 s, pre_skip=312.
fn build_ogg_page(serial: u32, sequence: u32, granule: u64, first: bool, last: bool, packets: &[&[u8]]) -> Vec<u8> {
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
    out.extend_from_slice(&0u32.to_le_bytes()); // CRC not validated
    out.push(segment_table.len() as u8);
    out.extend_from_slice(&segment_table);
    out.extend_from_slice(&payload);
    out
}

#[test]
fn s3_ogg_opus_pre_skip() {
    let mut head = b"OpusHead".to_vec();
    head.push(1); // version
    head.push(2); // channels
    head.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&48_000u32.to_le_bytes()); // input sample rate
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family

    let mut tags = b"OpusTags".to_vec();
    let vendor = b"demux-core";
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&2u32.to_le_bytes());
    for entry in ["TITLE=Test", "ARTIST=X"] {
        tags.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        tags.extend_from_slice(entry.as_bytes());
    }

    let mut out = Vec::new();
    out.extend_from_slice(&build_ogg_page(1, 0, 0, true, false, &[&head]));
    out.extend_from_slice(&build_ogg_page(1, 1, 0, false, false, &[&tags]));
    out.extend_from_slice(&build_ogg_page(1, 2, 24312, false, true, &[&[0u8; 20]]));

    let config = Config::default();
    let mut demux = factory::open(Box::new(MemoryStream::new(out)), Some("track.opus"), &config).unwrap();
    demux.parse_container().unwrap();

    let info = &demux.streams()[0];
    assert_eq!(info.codec_name, "opus");
    assert_eq!(info.sample_rate, 48_000);
    assert_eq!(info.channels, 2);
    assert_eq!(demux.duration_ms(), 500);
    assert_eq!(info.tags.title.as_deref(), Some("Test"));
    assert_eq!(info.tags.artist.as_deref(), Some("X"));

    let head_chunk = demux.read_chunk().unwrap();
    assert!(head_chunk.data.starts_with(b"OpusHead"));
    let tags_chunk = demux.read_chunk().unwrap();
    assert!(tags_chunk.data.starts_with(b"OpusTags"));
    let audio_chunk = demux.read_chunk().unwrap();
    assert!(!audio_chunk.is_eof());
    assert_eq!(audio_chunk.data.len(), 20);

    demux.seek_to(0).unwrap();
    let replayed_head = demux.read_chunk().unwrap();
    assert!(replayed_head.data.starts_with(b"OpusHead"));
}

// S4 — FLAC native 48 kHz stereo 16-bit, 3 frames of block_size 4096.
fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in bytes {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
        }
    }
    crc
}

fn encode_streaminfo(sample_rate: u32, channels: u8, bits_per_sample: u8, total_samples: u64) -> [u8; 34] {
    let mut out = [0u8; 34];
    out[0..2].copy_from_slice(&4096u16.to_be_bytes());
    out[2..4].copy_from_slice(&4096u16.to_be_bytes());
    out[10] = (sample_rate >> 12) as u8;
    out[11] = (sample_rate >> 4) as u8;
    out[12] = (((sample_rate & 0x0F) as u8) << 4) | (((channels - 1) & 0x07) << 1) | (((bits_per_sample - 1) >> 4) & 0x01);
    out[13] = (((bits_per_sample - 1) & 0x0F) << 4) | ((total_samples >> 32) as u8 & 0x0F);
    out[14] = (total_samples >> 24) as u8;
    out[15] = (total_samples >> 16) as u8;
    out[16] = (total_samples >> 8) as u8;
    out[17] = total_samples as u8;
    out
}

/// Fixed-blocksize frame, block size given as an explicit 16-bit value
/// (code 0x7) to land exactly on 4096 regardless of the coded-table steps;
/// sample rate and bits-per-sample come from STREAMINFO (code 0x0).
fn build_flac_frame(frame_number: u8, samples: &[u8]) -> Vec<u8> {
    let mut header = vec![0xFFu8, 0xF8, 0x70, 0x90];
    header.push(frame_number); // UTF-8 coded frame number, single byte form
    header.extend_from_slice(&4095u16.to_be_bytes()); // block size - 1 = 4095 -> 4096
    let crc = crc8(&header);
    header.push(crc);
    let mut out = header;
    out.extend_from_slice(samples);
    let footer_crc = crc16(&out);
    out.extend_from_slice(&footer_crc.to_be_bytes());
    out
}

fn build_flac_stream(streaminfo: [u8; 34], frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"fLaC");
    out.push(0x80); // last-block flag set, type STREAMINFO
    out.extend_from_slice(&[0, 0, 34]);
    out.extend_from_slice(&streaminfo);
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}

#[test]
fn s4_flac_three_frames() {
    let streaminfo = encode_streaminfo(48_000, 2, 16, 12_288);
    let block_bytes = vec![0u8; 32];
    let frames: Vec<Vec<u8>> = (0..3).map(|n| build_flac_frame(n, &block_bytes)).collect();
    let bytes = build_flac_stream(streaminfo, &frames);

    let config = Config::default();
    let mut demux = factory::open(Box::new(MemoryStream::new(bytes)), Some("track.flac"), &config).unwrap();
    demux.parse_container().unwrap();

    let info = &demux.streams()[0];
    assert_eq!(info.sample_rate, 48_000);
    assert_eq!(info.channels, 2);
    assert_eq!(demux.duration_ms(), 256);

    for expected_sample in [0u64, 4096, 8192] {
        let chunk = demux.read_chunk().unwrap();
        assert!(!chunk.is_eof());
        assert_eq!(chunk.granule, expected_sample);
    }
    let eof_chunk = demux.read_chunk().unwrap();
    assert!(eof_chunk.is_eof());

    // Seek to 150 ms (sample 7200): frame 1 spans samples 4096..8192, the
    // only frame straddling that sample, so the next chunk must land there.
    demux.seek_to(150).unwrap();
    let chunk = demux.read_chunk().unwrap();
    assert!(!chunk.is_eof());
    assert!(chunk.granule <= 7200 && 7200 <= chunk.granule + 4096);
    assert_eq!(chunk.granule, 4096);
}

// S6 — FLAC with an injected CRC-16 error on frame 2.
#[test]
fn s6_flac_crc_error_recovery() {
    let streaminfo = encode_streaminfo(48_000, 2, 16, 12_288);
    let block_bytes = vec![0u8; 32];
    let mut frames: Vec<Vec<u8>> = (0..3).map(|n| build_flac_frame(n, &block_bytes)).collect();
    let last = frames[1].len() - 1;
    frames[1][last] ^= 0xFF; // corrupt frame 2's CRC-16 footer
    let bytes = build_flac_stream(streaminfo, &frames);

    let mut config = Config::default();
    config.flac.crc_validation = CrcValidation::Enabled;
    config.flac.crc_error_threshold = 10;
    let mut demux = factory::open(Box::new(MemoryStream::new(bytes)), Some("track.flac"), &config).unwrap();
    demux.parse_container().unwrap();

    for _ in 0..3 {
        let chunk = demux.read_chunk().unwrap();
        assert!(!chunk.is_eof());
    }
    assert!(demux.read_chunk().unwrap().is_eof());
    assert_eq!(demux.recovery_stats().snapshot().checksum_failures, 1);
}

// S5 — MP4 AAC-LC 44.1 kHz stereo, 1.000 s, single track.
fn build_esds(object_type: u8, asc: &[u8]) -> Vec<u8> {
    let mut dec_specific = vec![DECODER_SPECIFIC_DESCRIPTOR_TAG, asc.len() as u8];
    dec_specific.extend_from_slice(asc);

    let mut dec_config = vec![DECODER_CONFIG_TAG];
    let mut dec_config_body = vec![object_type];
    dec_config_body.extend_from_slice(&[0x15, 0, 0, 0, 0, 0, 0, 0]); // stream type(1) + buffer size(3) + max bitrate(4)
    dec_config_body.extend_from_slice(&128_000u32.to_be_bytes()); // average bitrate
    dec_config_body.extend_from_slice(&dec_specific);
    dec_config.push(dec_config_body.len() as u8);
    dec_config.extend_from_slice(&dec_config_body);

    let mut es_descriptor = vec![ELEMENTARY_DESCRIPTOR_TAG];
    let mut es_body = vec![0u8, 1u8, 0u8]; // ES ID (2 bytes) + flags
    es_body.extend_from_slice(&dec_config);
    es_descriptor.push(es_body.len() as u8);
    es_descriptor.extend_from_slice(&es_body);

    let mut esds = vec![0u8; 4]; // version/flags
    esds.extend_from_slice(&es_descriptor);
    esds
}

const ELEMENTARY_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_TAG: u8 = 0x04;
const DECODER_SPECIFIC_DESCRIPTOR_TAG: u8 = 0x05;

#[test]
fn s5_mp4_aac_lc() {
    let ftyp = be_box(b"ftyp", b"M4A \0\0\0\0");

    let mut tkhd = vec![0u8; 4];
    tkhd.extend_from_slice(&[0u8; 8]);
    tkhd.extend_from_slice(&1u32.to_be_bytes());

    let sample_count = 43u32; // 44100 / 1024 rounded up
    let mut mdhd = vec![0u8; 4];
    mdhd.extend_from_slice(&[0u8; 8]);
    mdhd.extend_from_slice(&44_100u32.to_be_bytes());
    mdhd.extend_from_slice(&44_100u32.to_be_bytes());

    let mut hdlr = vec![0u8; 8];
    hdlr.extend_from_slice(b"soun");
    hdlr.extend_from_slice(&[0u8; 12]);

    // AAC-LC (object type 0x40), 44100 Hz (frequency index 4), stereo.
    let asc = [0x12, 0x10];
    let esds = build_esds(0x40, &asc);
    let mut mp4a_entry = vec![0u8; 6]; // reserved
    mp4a_entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    mp4a_entry.extend_from_slice(&[0u8; 8]); // version/revision/vendor
    mp4a_entry.extend_from_slice(&2u16.to_be_bytes()); // channels
    mp4a_entry.extend_from_slice(&16u16.to_be_bytes()); // sample size
    mp4a_entry.extend_from_slice(&[0u8; 4]); // compression id + packet size
    mp4a_entry.extend_from_slice(&(44_100u32 << 16).to_be_bytes());
    mp4a_entry.extend_from_slice(&be_box(b"esds", &esds));
    let mp4a = be_box(b"mp4a", &mp4a_entry);

    let mut stsd = vec![0u8; 4];
    stsd.extend_from_slice(&1u32.to_be_bytes());
    stsd.extend_from_slice(&mp4a);

    let mut stts = vec![0u8; 4];
    stts.extend_from_slice(&1u32.to_be_bytes());
    stts.extend_from_slice(&sample_count.to_be_bytes());
    stts.extend_from_slice(&1024u32.to_be_bytes());

    let mut stsc = vec![0u8; 4];
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&sample_count.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());

    let frame_size = 32u32;
    let mut stsz = vec![0u8; 4];
    stsz.extend_from_slice(&frame_size.to_be_bytes());
    stsz.extend_from_slice(&sample_count.to_be_bytes());

    let stbl_without_stco = [
        be_box(b"stsd", &stsd),
        be_box(b"stts", &stts),
        be_box(b"stsc", &stsc),
        be_box(b"stsz", &stsz),
    ]
    .concat();

    let mut mvhd = vec![0u8; 4];
    mvhd.extend_from_slice(&[0u8; 8]);
    mvhd.extend_from_slice(&44_100u32.to_be_bytes());
    mvhd.extend_from_slice(&44_100u32.to_be_bytes());

    let build_with_offset = |offset: u32| -> Vec<u8> {
        let mut stco = vec![0u8; 4];
        stco.extend_from_slice(&1u32.to_be_bytes());
        stco.extend_from_slice(&offset.to_be_bytes());
        let stbl = [stbl_without_stco.clone(), be_box(b"stco", &stco)].concat();
        let minf = be_box(b"minf", &be_box(b"stbl", &stbl));
        let mdia = [be_box(b"mdhd", &mdhd), be_box(b"hdlr", &hdlr), minf].concat();
        let trak = be_box(b"trak", &[be_box(b"tkhd", &tkhd), be_box(b"mdia", &mdia)].concat());
        let moov = be_box(b"moov", &[be_box(b"mvhd", &mvhd), trak].concat());
        [ftyp.clone(), moov].concat()
    };

    let header_only = build_with_offset(0);
    let mdat_data_offset = header_only.len() as u32 + 8;
    let mut out = build_with_offset(mdat_data_offset);
    let mdat_payload = vec![0u8; (frame_size * sample_count) as usize];
    out.extend_from_slice(&be_box(b"mdat", &mdat_payload));

    let config = Config::default();
    let mut demux = factory::open(Box::new(MemoryStream::new(out)), Some("track.m4a"), &config).unwrap();
    demux.parse_container().unwrap();

    let info = &demux.streams()[0];
    assert_eq!(info.codec_name, "aac");
    assert_eq!(info.sample_rate, 44_100);
    assert_eq!(info.channels, 2);
    // 43 frames of 1024 samples at 44100 Hz is a hair under one second.
    assert!((990..=1000).contains(&demux.duration_ms()));

    demux.seek_to(500).unwrap();
    let chunk = demux.read_chunk().unwrap();
    assert!(!chunk.is_eof());
    let sample_number = chunk.granule / 1024;
    assert_eq!(sample_number, 21);
}
