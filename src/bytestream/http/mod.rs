//! HTTP range-request [`ByteStream`] implementation.
//!
//! Opens a URL, probes it for size and range support, then serves reads out
//! of a primary in-memory window backed by a [`crate::pool::BufferPool`]
//! loan, refilling with adaptively sized range requests and, for sequential
//! access, a read-ahead window fetched one step in advance.

mod retry;

use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::StatusCode;
use url::Url;

use crate::bytestream::{ByteStream, Whence};
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, Loan};

use retry::{CircuitBreaker, ErrorCategory};

const MIN_WINDOW_BYTES: u64 = 16 * 1024;
const MAX_WINDOW_BYTES: u64 = 1024 * 1024;
const MAX_BUFFER_BYTES: u64 = 1024 * 1024;
const MAX_TOTAL_WINDOW_BYTES: u64 = 2 * 1024 * 1024;
const READAHEAD_TRIGGER_READS: u32 = 3;
const READAHEAD_TRIGGER_SPAN: u64 = 128 * 1024;
const THROUGHPUT_EMA_ALPHA: f64 = 0.3;

/// Error counts partitioned by category, exposed through [`HttpStream::stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorCounts {
    pub timeout: u64,
    pub connection: u64,
    pub http: u64,
}

impl ErrorCounts {
    fn merge(&mut self, other: Self) {
        self.timeout += other.timeout;
        self.connection += other.connection;
        self.http += other.http;
    }
}

fn record_error(counts: &mut ErrorCounts, category: ErrorCategory) {
    match category {
        ErrorCategory::Timeout => counts.timeout += 1,
        ErrorCategory::Connection => counts.connection += 1,
        ErrorCategory::Http => counts.http += 1,
    }
}

/// Observable state of an [`HttpStream`], per specification §4.1.1.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub position: u64,
    pub eof: bool,
    pub throughput_bps: f64,
    pub request_count: u64,
    pub bytes_downloaded: u64,
    pub errors: ErrorCounts,
}

struct Window {
    start: u64,
    buf: Loan,
}

impl Window {
    fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end()
    }
}

/// A [`ByteStream`] backed by HTTP range requests.
pub struct HttpStream {
    url: Url,
    client: Client,
    pool: BufferPool,
    config: HttpConfig,
    size: Option<u64>,
    content_type: Option<String>,
    accept_ranges: bool,
    pos: u64,
    eof: bool,
    last_error: Option<Error>,
    window: Option<Window>,
    read_ahead: Option<Window>,
    consecutive_forward_reads: u32,
    last_read_end: Option<u64>,
    throughput_bps: f64,
    request_count: u64,
    bytes_downloaded: u64,
    errors: ErrorCounts,
    breaker: CircuitBreaker,
}

impl HttpStream {
    /// Opens `url`, using the process-wide default [`BufferPool`].
    pub fn open(url: Url, config: HttpConfig) -> Result<Self> {
        Self::open_with_pool(url, config, crate::pool::global().clone())
    }

    /// Opens `url`, using an explicitly supplied buffer pool.
    pub fn open_with_pool(url: Url, config: HttpConfig, pool: BufferPool) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        let mut stream = Self {
            url,
            client,
            pool,
            config,
            size: None,
            content_type: None,
            accept_ranges: false,
            pos: 0,
            eof: false,
            last_error: None,
            window: None,
            read_ahead: None,
            consecutive_forward_reads: 0,
            last_read_end: None,
            throughput_bps: 0.0,
            request_count: 0,
            bytes_downloaded: 0,
            errors: ErrorCounts::default(),
            breaker: CircuitBreaker::new(),
        };
        stream.probe()?;
        Ok(stream)
    }

    /// Normalised, parameter-stripped MIME type reported by the server, if
    /// any (e.g. `"audio/flac"`, never `"audio/flac; charset=..."`).
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Current observable state.
    #[must_use]
    pub fn stats(&self) -> Stats {
        Stats {
            position: self.pos,
            eof: self.eof,
            throughput_bps: self.throughput_bps,
            request_count: self.request_count,
            bytes_downloaded: self.bytes_downloaded,
            errors: self.errors,
        }
    }

    fn probe(&mut self) -> Result<()> {
        let headers = self.head_with_retry()?;
        self.size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        self.content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
        self.accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        if !self.accept_ranges {
            self.accept_ranges = self.probe_range_support()?;
        }
        Ok(())
    }

    fn head_with_retry(&mut self) -> Result<HeaderMap> {
        let url = self.url.clone();
        let client = self.client.clone();
        let max_retries = self.config.max_retries;
        let mut counts = ErrorCounts::default();

        let result = retry::retry(
            &self.breaker,
            max_retries,
            || match client.head(url.clone()).send() {
                Ok(response) => {
                    if let Some(failure) = retry::classify_status(response.status(), retry_after(&response)) {
                        return Err(failure);
                    }
                    Ok(response.headers().clone())
                }
                Err(e) => Err(retry::classify_transport(e)),
            },
            |category| record_error(&mut counts, category),
        );
        self.request_count += result.attempts;
        self.errors.merge(counts);
        result.result
    }

    fn probe_range_support(&mut self) -> Result<bool> {
        let url = self.url.clone();
        let client = self.client.clone();
        let max_retries = self.config.max_retries;
        let mut counts = ErrorCounts::default();

        let result = retry::retry(
            &self.breaker,
            max_retries,
            || match client.get(url.clone()).header(RANGE, "bytes=0-0").send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::PARTIAL_CONTENT {
                        Ok(true)
                    } else if status.is_success() {
                        Ok(false)
                    } else if let Some(failure) = retry::classify_status(status, retry_after(&response)) {
                        Err(failure)
                    } else {
                        Ok(false)
                    }
                }
                Err(e) => Err(retry::classify_transport(e)),
            },
            |category| record_error(&mut counts, category),
        );
        self.request_count += result.attempts;
        self.errors.merge(counts);
        result.result
    }

    fn window_size_for(&self) -> u64 {
        if self.throughput_bps <= 0.0 {
            return MIN_WINDOW_BYTES;
        }
        // Target roughly a quarter-second of data at the current estimated
        // throughput, clamped to the adaptive range.
        let target = (self.throughput_bps * 0.25) as u64;
        target.clamp(MIN_WINDOW_BYTES, MAX_WINDOW_BYTES)
    }

    fn pressure_scaled_cap(&self, cap: u64) -> u64 {
        match self.pool.pressure() {
            crate::pool::PressureLevel::Normal => cap,
            crate::pool::PressureLevel::High => cap / 2,
            crate::pool::PressureLevel::Critical => cap / 4,
        }
    }

    fn wants_readahead(&self) -> bool {
        self.config.read_ahead_enabled && self.consecutive_forward_reads >= READAHEAD_TRIGGER_READS
    }

    fn note_access(&mut self, start: u64) {
        let sequential = self
            .last_read_end
            .is_some_and(|end| start >= end && start - end <= READAHEAD_TRIGGER_SPAN);
        if sequential {
            self.consecutive_forward_reads = self.consecutive_forward_reads.saturating_add(1);
        } else {
            self.consecutive_forward_reads = 0;
            self.read_ahead = None;
        }
    }

    fn fetch_range(&mut self, start: u64, want: u64) -> Result<Loan> {
        let want = want.min(self.pressure_scaled_cap(MAX_BUFFER_BYTES)).max(1);
        let end = self
            .size
            .map_or(start + want - 1, |size| (start + want - 1).min(size.saturating_sub(1)));

        let url = self.url.clone();
        let client = self.client.clone();
        let max_retries = self.config.max_retries;
        let range_header = format!("bytes={start}-{end}");
        let began = Instant::now();
        let mut counts = ErrorCounts::default();

        let outcome = retry::retry(
            &self.breaker,
            max_retries,
            || match client.get(url.clone()).header(RANGE, &range_header).send() {
                Ok(response) => {
                    let status = response.status();
                    if let Some(failure) = retry::classify_status(status, retry_after(&response)) {
                        return Err(failure);
                    }
                    response.bytes().map_err(retry::classify_transport)
                }
                Err(e) => Err(retry::classify_transport(e)),
            },
            |category| record_error(&mut counts, category),
        );

        self.request_count += outcome.attempts;
        self.errors.merge(counts);
        let bytes = outcome.result?;
        self.bytes_downloaded += bytes.len() as u64;

        let elapsed = began.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let sample_bps = bytes.len() as f64 / elapsed;
            self.throughput_bps = if self.throughput_bps <= 0.0 {
                sample_bps
            } else {
                THROUGHPUT_EMA_ALPHA * sample_bps + (1.0 - THROUGHPUT_EMA_ALPHA) * self.throughput_bps
            };
        }

        let mut loan = self.pool.acquire(bytes.len().max(1))?;
        loan[..bytes.len()].copy_from_slice(&bytes);
        Ok(loan)
    }

    fn refill_window(&mut self, pos: u64) -> Result<()> {
        if let Some(ahead) = self.read_ahead.take() {
            if ahead.contains(pos) {
                self.window = Some(ahead);
                self.maybe_start_readahead()?;
                return Ok(());
            }
        }

        let want = self.window_size_for();
        let buf = self.fetch_range(pos, want)?;
        self.window = Some(Window { start: pos, buf });
        self.maybe_start_readahead()?;
        Ok(())
    }

    fn maybe_start_readahead(&mut self) -> Result<()> {
        if !self.wants_readahead() || self.read_ahead.is_some() || !self.accept_ranges {
            return Ok(());
        }
        let Some(window) = &self.window else { return Ok(()) };
        let next_start = window.end();
        if let Some(size) = self.size {
            if next_start >= size {
                return Ok(());
            }
        }

        let primary_len = window.buf.len() as u64;
        let remaining_budget = self
            .pressure_scaled_cap(MAX_TOTAL_WINDOW_BYTES)
            .saturating_sub(primary_len);
        if remaining_budget < MIN_WINDOW_BYTES {
            return Ok(());
        }

        let want = self.window_size_for().min(remaining_budget);
        let buf = self.fetch_range(next_start, want)?;
        self.read_ahead = Some(Window { start: next_start, buf });
        Ok(())
    }
}

impl ByteStream for HttpStream {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if self.size.is_some_and(|size| self.pos >= size) {
            self.eof = true;
            return Ok(0);
        }

        self.note_access(self.pos);

        let need_refill = match &self.window {
            Some(window) => !window.contains(self.pos),
            None => true,
        };
        if need_refill {
            if !self.accept_ranges && self.pos != 0 {
                let message = "server does not support range requests; cannot seek";
                self.last_error = Some(Error::io(message));
                return Err(Error::io(message));
            }
            self.refill_window(self.pos)?;
        }

        let window = self.window.as_ref().expect("just refilled");
        let offset = (self.pos - window.start) as usize;
        let available = window.buf.len() - offset;
        let n = dst.len().min(available);
        dst[..n].copy_from_slice(&window.buf[offset..offset + n]);

        self.pos += n as u64;
        self.last_read_end = Some(self.pos);
        if self.size.is_some_and(|size| self.pos >= size) {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos as i64,
            Whence::End => {
                let size = self
                    .size
                    .ok_or_else(|| Error::io("cannot seek from end: size unknown"))?;
                size as i64
            }
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| Error::io("seek offset overflow"))?;
        if target < 0 {
            return Err(Error::io("seek to negative offset"));
        }
        if let Some(size) = self.size {
            if target as u64 > size {
                return Err(Error::io(format!("seek to {target} beyond size {size}")));
            }
        }
        if !self.accept_ranges && target as u64 != self.pos {
            return Err(Error::io("server does not support range requests; cannot seek"));
        }

        self.pos = target as u64;
        self.eof = self.size.is_some_and(|size| self.pos >= size);
        self.consecutive_forward_reads = 0;
        self.last_read_end = None;
        Ok(self.pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
