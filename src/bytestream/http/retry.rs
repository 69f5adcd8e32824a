//! Retry, jitter and circuit-breaking for the HTTP byte stream.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use exponential_backoff::Backoff;
use reqwest::StatusCode;

use crate::error::{Error, Result};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.25;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const CIRCUIT_FAILURE_THRESHOLD: u32 = 10;
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(5 * 60);

/// Whether a failed status code is worth retrying.
///
/// Mirrors the specification's non-recoverable set (400-415, 501, 505, 506);
/// everything else, including 5xx server errors and 429, is retried.
fn is_recoverable_status(status: StatusCode) -> bool {
    let code = status.as_u16();
    !matches!(code, 400..=415 | 501 | 505 | 506)
}

/// Whether a transport-level [`reqwest::Error`] is plausibly transient.
fn is_recoverable_transport(err: &reqwest::Error) -> bool {
    if err.is_builder() {
        return false; // malformed URL and friends are never retryable.
    }
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Breaks a persistently failing endpoint, keeping retries from hammering
/// a server (or waiting on a dead one) once it's clearly unreachable.
///
/// Plain atomics rather than a mutex: callers hold this behind an `Arc` so
/// it can be read and updated without borrowing the [`super::HttpStream`]
/// that owns the retry loop.
pub(super) struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
}

impl CircuitBreaker {
    pub(super) fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    /// Returns an error without attempting anything if the breaker is open.
    pub(super) fn check(&self) -> Result<()> {
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        if opened_at == 0 {
            return Ok(());
        }
        let elapsed = now_millis().saturating_sub(opened_at);
        if elapsed < CIRCUIT_OPEN_DURATION.as_millis() as u64 {
            return Err(Error::io("circuit breaker open: too many consecutive HTTP failures"));
        }
        // Cooldown elapsed; allow a trial request through.
        self.opened_at_millis.store(0, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        Ok(())
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= CIRCUIT_FAILURE_THRESHOLD {
            self.opened_at_millis.store(now_millis(), Ordering::Release);
        }
    }
}

fn now_millis() -> u64 {
    // `Instant` has no fixed epoch, so a process-local monotonic counter
    // anchored at first use stands in for wall-clock time here.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Outcome classification fed back into the byte stream's error counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ErrorCategory {
    Timeout,
    Connection,
    Http,
}

/// Outcome of [`retry`]: the underlying result, plus how many requests it
/// took to get there (for request-count accounting, regardless of outcome).
pub(super) struct Outcome<T> {
    pub(super) result: Result<T>,
    pub(super) attempts: u64,
}

/// Runs `op` with up to `max_retries` retries, exponential backoff with
/// jitter, `Retry-After` honoring and circuit-breaker gating.
///
/// `op` should perform exactly one HTTP request and classify its own
/// failure via the returned `Result<T, (Error, Option<ErrorCategory>, Option<Duration>)>`
/// tuple: the error, its category (for stats), and a server-requested
/// `Retry-After` delay, if any.
pub(super) fn retry<T>(
    breaker: &CircuitBreaker,
    max_retries: u32,
    mut op: impl FnMut() -> std::result::Result<T, (Error, Option<ErrorCategory>, Option<Duration>)>,
    mut on_error: impl FnMut(ErrorCategory),
) -> Outcome<T> {
    if let Err(e) = breaker.check() {
        return Outcome { result: Err(e), attempts: 0 };
    }

    let backoff = Backoff::new(max_retries, BASE_BACKOFF, MAX_BACKOFF);
    let mut attempts = 0u64;

    for delay in backoff {
        attempts += 1;
        match op() {
            Ok(value) => {
                breaker.record_success();
                return Outcome { result: Ok(value), attempts };
            }
            Err((err, category, retry_after)) => {
                breaker.record_failure();

                let Some(category) = category else {
                    // Non-recoverable: fail immediately, no retry.
                    return Outcome { result: Err(err), attempts };
                };
                on_error(category);

                let wait = match (retry_after, delay) {
                    (Some(retry_after), _) => retry_after.min(MAX_RETRY_AFTER),
                    (None, Some(delay)) => jittered(delay),
                    (None, None) => return Outcome { result: Err(err), attempts },
                };
                std::thread::sleep(wait);
            }
        }
    }

    Outcome {
        result: Err(Error::io(format!("exhausted {attempts} retries"))),
        attempts,
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter_max = delay.mul_f64(JITTER_FRACTION);
    let jitter = jitter_max.mul_f64(fastrand::f64());
    (delay + jitter).min(MAX_BACKOFF)
}

/// Classifies a transport error for retry-eligibility and stats bucketing.
pub(super) fn classify_transport(err: reqwest::Error) -> (Error, Option<ErrorCategory>, Option<Duration>) {
    let recoverable = is_recoverable_transport(&err);
    let category = if err.is_timeout() {
        Some(ErrorCategory::Timeout)
    } else if recoverable {
        Some(ErrorCategory::Connection)
    } else {
        None
    };
    let wrapped = Error::from(err);
    (wrapped, category, None)
}

/// Classifies an HTTP response status for retry-eligibility, stats
/// bucketing and `Retry-After` extraction.
pub(super) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
) -> Option<(Error, Option<ErrorCategory>, Option<Duration>)> {
    if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
        return None;
    }
    if !is_recoverable_status(status) {
        return Some((
            Error::io(format!("non-recoverable HTTP status {status}")),
            None,
            None,
        ));
    }
    Some((
        Error::io(format!("HTTP status {status}")),
        Some(ErrorCategory::Http),
        retry_after,
    ))
}
