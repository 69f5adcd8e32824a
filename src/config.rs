//! Configuration surface for the demultiplexing core.
//!
//! Every knob here corresponds to an option documented in the specification's
//! external-interfaces section. There are no environment variables and no CLI
//! surface defined by this crate — embedding applications construct a
//! [`Config`] directly.
//!
//! # Examples
//!
//! ```rust
//! use demux_core::config::{Config, CrcValidation, StreamableSubsetMode};
//!
//! let mut config = Config::default();
//! config.flac.crc_validation = CrcValidation::Strict;
//! config.flac.streamable_subset_mode = StreamableSubsetMode::Warn;
//! ```

use std::time::Duration;

/// Top-level configuration, aggregating every subsystem's options.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Buffer pool limits (§4.2).
    pub buffer_pool: BufferPoolConfig,
    /// HTTP byte-stream behavior (§4.1.1).
    pub http: HttpConfig,
    /// FLAC demuxer behavior (§4.3.4).
    pub flac: FlacConfig,
    /// ISO-BMFF demuxer behavior (§4.3.3).
    pub iso: IsoConfig,
}

/// Buffer pool configuration (§4.2, §6).
#[derive(Clone, Copy, Debug)]
pub struct BufferPoolConfig {
    /// Hard upper bound on pooled memory across all size classes.
    ///
    /// Default: 16 MiB. Absolute ceiling: 32 MiB (enforced by the pool
    /// itself regardless of this value).
    pub max_pool_bytes: usize,
    /// Per-size-class free-list cap.
    ///
    /// Default: 8.
    pub max_buffers_per_class: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_bytes: 16 * 1024 * 1024,
            max_buffers_per_class: 8,
        }
    }
}

/// HTTP byte-stream configuration (§4.1.1, §6).
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Per-request timeout.
    ///
    /// Default: 30 seconds.
    pub timeout: Duration,
    /// Maximum number of retries per operation before surfacing a fatal
    /// I/O error.
    ///
    /// Default: 3.
    pub max_retries: u32,
    /// Whether sequential access triggers a read-ahead prefetch window.
    ///
    /// Default: `true`.
    pub read_ahead_enabled: bool,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            read_ahead_enabled: true,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// CRC validation strictness for FLAC frames (§4.3.4, §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrcValidation {
    /// Skip CRC-8/CRC-16 checks entirely.
    Disabled,
    /// Validate, but tolerate up to `crc_error_threshold` failures per file
    /// before disabling validation for the remainder of the stream.
    Enabled,
    /// Reject and skip any frame that fails CRC validation, unconditionally.
    Strict,
}

/// Streamable-subset (RFC 9639 §7) enforcement mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamableSubsetMode {
    /// Do not check subset constraints.
    Disabled,
    /// Count violations but keep decoding.
    Warn,
    /// Reject frames that violate the subset constraints.
    Strict,
}

/// FLAC demuxer configuration (§4.3.4, §6).
#[derive(Clone, Copy, Debug)]
pub struct FlacConfig {
    /// CRC validation strictness.
    pub crc_validation: CrcValidation,
    /// Count of CRC errors tolerated (in `Enabled` mode) before validation
    /// auto-disables for the rest of the file.
    ///
    /// Default: 10.
    pub crc_error_threshold: u32,
    /// Whether to build and use the sample-offset frame index for seeking.
    ///
    /// Default: `true`.
    pub frame_indexing_enabled: bool,
    /// Streamable-subset enforcement.
    pub streamable_subset_mode: StreamableSubsetMode,
    /// If `true`, frames skipped by recovery are replaced with synthesised
    /// silence chunks of the same block size rather than omitted outright.
    pub synthesize_silence_on_skip: bool,
}

impl Default for FlacConfig {
    fn default() -> Self {
        Self {
            crc_validation: CrcValidation::Enabled,
            crc_error_threshold: 10,
            frame_indexing_enabled: true,
            streamable_subset_mode: StreamableSubsetMode::Disabled,
            synthesize_silence_on_skip: false,
        }
    }
}

/// ISO/IEC 14496-12 compliance strictness (§4.3.3, §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComplianceLevel {
    /// Any deviation from the standard is an error.
    Strict,
    /// Deviations are tolerated and counted as warnings.
    Relaxed,
    /// Deviations are tolerated silently; only structural failures abort
    /// parsing.
    Permissive,
}

/// ISO-BMFF demuxer configuration (§4.3.3, §6).
#[derive(Clone, Copy, Debug)]
pub struct IsoConfig {
    /// Compliance strictness used by the validator.
    pub compliance_level: ComplianceLevel,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            compliance_level: ComplianceLevel::Relaxed,
        }
    }
}
