//! Content-sniffing dispatch: identifies a byte stream's container format
//! from its leading bytes and hands back the matching [`demux::Demuxer`].
//!
//! Probing never has an observable effect on the stream's position: the
//! current offset is saved before the probe read and restored afterward,
//! regardless of outcome.

use crate::bytestream::{ByteStream, Whence};
use crate::config::Config;
use crate::demux::flac::FlacDemuxer;
use crate::demux::iso::IsoDemuxer;
use crate::demux::ogg::OggDemuxer;
use crate::demux::riff::RiffDemuxer;
use crate::demux::Demuxer;
use crate::error::{Error, Result};

const PROBE_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Format {
    Wave,
    Aiff,
    Ogg,
    Flac,
    Iso,
}

impl Format {
    fn matches_extension(self, ext: &str) -> bool {
        match self {
            Format::Wave => ext == "wav",
            Format::Aiff => matches!(ext, "aif" | "aiff" | "aifc"),
            Format::Ogg => matches!(ext, "ogg" | "oga" | "opus" | "spx"),
            Format::Flac => ext == "flac",
            Format::Iso => matches!(ext, "m4a" | "mp4" | "mov" | "3gp"),
        }
    }
}

struct Candidate {
    format: Format,
    priority: u32,
}

/// Identifies `stream`'s container format and constructs the matching
/// demultiplexer. `path_hint`, if given, is used only to break a priority
/// tie between ambiguous signature matches (practically never reached,
/// since the recognised magic bytes are mutually exclusive).
pub fn open(stream: Box<dyn ByteStream>, path_hint: Option<&str>, config: &Config) -> Result<Box<dyn Demuxer>> {
    let mut stream = stream;
    let probe = read_probe(&mut *stream)?;
    let candidates = detect_candidates(&probe);
    let format = select(&candidates, path_hint)?;

    Ok(match format {
        Format::Wave | Format::Aiff => Box::new(RiffDemuxer::new(stream)),
        Format::Ogg => Box::new(OggDemuxer::new(stream)),
        Format::Flac => Box::new(FlacDemuxer::new(stream, config.flac)),
        Format::Iso => Box::new(IsoDemuxer::new(stream, config.iso)),
    })
}

fn read_probe(stream: &mut dyn ByteStream) -> Result<Vec<u8>> {
    let saved_pos = stream.tell();
    stream.seek(0, Whence::Start)?;

    let mut buf = vec![0u8; PROBE_SIZE];
    let mut filled = 0;
    loop {
        if filled >= buf.len() || stream.eof() {
            break;
        }
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    stream.seek(saved_pos as i64, Whence::Start)?;
    Ok(buf)
}

fn fourcc_at(probe: &[u8], offset: usize) -> Option<[u8; 4]> {
    probe.get(offset..offset + 4)?.try_into().ok()
}

fn detect_candidates(probe: &[u8]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let at0 = fourcc_at(probe, 0);
    let at4 = fourcc_at(probe, 4);
    let at8 = fourcc_at(probe, 8);

    if at0 == Some(*b"RIFF") && at8 == Some(*b"WAVE") {
        candidates.push(Candidate { format: Format::Wave, priority: 100 });
    }
    if at0 == Some(*b"FORM") && (at8 == Some(*b"AIFF") || at8 == Some(*b"AIFC")) {
        candidates.push(Candidate { format: Format::Aiff, priority: 100 });
    }
    if at0 == Some(*b"OggS") {
        candidates.push(Candidate { format: Format::Ogg, priority: 100 });
    }
    if at0 == Some(*b"fLaC") {
        candidates.push(Candidate { format: Format::Flac, priority: 100 });
    }
    if at4 == Some(*b"ftyp") {
        candidates.push(Candidate { format: Format::Iso, priority: 100 });
    }
    candidates
}

fn select(candidates: &[Candidate], path_hint: Option<&str>) -> Result<Format> {
    let max_priority = candidates.iter().map(|c| c.priority).max().ok_or_else(|| Error::format("unrecognised container format"))?;
    let top: Vec<&Candidate> = candidates.iter().filter(|c| c.priority == max_priority).collect();
    if top.len() == 1 {
        return Ok(top[0].format);
    }

    if let Some(ext) = path_hint.and_then(|p| p.rsplit('.').next()) {
        let ext = ext.to_ascii_lowercase();
        if let Some(candidate) = top.iter().find(|c| c.format.matches_extension(&ext)) {
            return Ok(candidate.format);
        }
    }
    Ok(top[0].format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytestream::MemoryStream;

    #[test]
    fn detects_riff_wave() {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        let config = Config::default();
        let demux = open(Box::new(MemoryStream::new(bytes)), Some("track.wav"), &config).unwrap();
        assert_eq!(demux.streams().len(), 0);
    }

    #[test]
    fn probe_does_not_move_stream_position() {
        let mut bytes = b"fLaC".to_vec();
        bytes.extend_from_slice(&[0u8; 128]);
        let mut stream = MemoryStream::new(bytes);
        stream.seek(10, Whence::Start).unwrap();
        let probe = read_probe(&mut stream).unwrap();
        assert!(!probe.is_empty());
        assert_eq!(stream.tell(), 10);
    }

    #[test]
    fn unrecognised_bytes_are_rejected() {
        let config = Config::default();
        let bytes = vec![0u8; 16];
        assert!(open(Box::new(MemoryStream::new(bytes)), None, &config).is_err());
    }

    #[test]
    fn ambiguous_priority_breaks_tie_on_extension() {
        // Synthetic: both formats forced to the same priority via direct
        // candidate construction, since no real signature collides in practice.
        let candidates = vec![
            Candidate { format: Format::Wave, priority: 100 },
            Candidate { format: Format::Aiff, priority: 100 },
        ];
        assert_eq!(select(&candidates, Some("track.aif")).unwrap(), Format::Aiff);
        assert_eq!(select(&candidates, Some("track.wav")).unwrap(), Format::Wave);
    }
}
