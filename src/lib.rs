//! Media container demultiplexing core.
//!
//! This crate reads arbitrary audio container files, identifies their
//! format, extracts encoded audio frames together with timing metadata, and
//! serves those frames to an external decoder on demand. It also provides the
//! I/O substrate the demultiplexers are written against: a memory-bounded
//! buffer pool and local-file/HTTP implementations of a uniform
//! random-access byte-stream abstraction.
//!
//! # Architecture
//!
//! The crate is organized into four cooperating layers:
//!
//! * [`bytestream`]: a seekable random-access byte source, with local-file,
//!   HTTP and in-memory implementations.
//! * [`pool`]: a process-wide, size-classed buffer cache with memory-pressure
//!   driven eviction, shared by the HTTP byte stream and the demultiplexers.
//! * [`demux`]: one demultiplexer per container family (RIFF/WAVE, AIFF,
//!   Ogg, ISO-BMFF, native FLAC) behind the common [`demux::Demuxer`] trait.
//! * [`factory`]: content-sniffing dispatch that selects the right
//!   demultiplexer for an opened byte stream.
//!
//! Dataflow: open a [`bytestream::ByteStream`], hand it to
//! [`factory::open`], then pull [`demux::MediaChunk`] values from the
//! returned [`demux::Demuxer`] for an external decoder to consume.
//!
//! # Scope
//!
//! Audio decoder implementations (Vorbis, Opus, FLAC bitstream decoding,
//! AAC, ALAC, PCM companding), playlist management, and remote-control
//! surfaces are explicitly out of scope — they are external collaborators
//! that consume [`demux::MediaChunk`] and [`demux::StreamInfo`] values
//! produced here.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod bytestream;
pub mod config;
pub mod demux;
pub mod error;
pub mod factory;
pub mod pool;
