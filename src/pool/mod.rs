//! Process-wide, size-classed buffer pool with pressure-driven eviction.
//!
//! Amortises large-buffer allocation across demultiplexer chunk reads and
//! HTTP byte-stream windows. A single [`BufferPool`] is cheap to clone (it is
//! an `Arc` handle) and is meant to be shared by every byte stream and
//! demultiplexer in a process; [`global`] hands out one such shared instance
//! with a background pressure monitor already running.

mod class;
pub mod monitor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::config::BufferPoolConfig;
use crate::error::Result;

use class::ClassState;

/// Buffers smaller than this are allocated directly, bypassing the pool.
const MIN_POOLED_SIZE: usize = 1024;
/// Buffers larger than this are allocated directly, bypassing the pool.
///
/// The specification also describes a 64 KiB-aligned size-class tier above
/// 1 MiB, but pairs it with "buffers ... above 1 MiB are not pooled" — that
/// tier is therefore unreachable and is not implemented; see `DESIGN.md`.
const MAX_POOLED_SIZE: usize = 1024 * 1024;

/// Common classes pre-seeded at startup under normal pressure.
const PREALLOC_CLASSES: &[usize] = &[
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
];
const PREALLOC_COUNT: usize = 2;

/// Absolute hard ceiling enforced regardless of configuration.
const ABSOLUTE_MAX_POOL_BYTES: usize = 32 * 1024 * 1024;

/// Memory-pressure level as computed by the background [`monitor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PressureLevel {
    Normal = 0,
    High = 1,
    Critical = 2,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::High,
            2 => Self::Critical,
            _ => Self::Normal,
        }
    }

    /// Fraction of each evicted class's free list removed when this level's
    /// effective limits force eviction.
    fn eviction_factor(self) -> f64 {
        match self {
            Self::Normal => 0.5,
            Self::High => 0.75,
            Self::Critical => 0.9,
        }
    }
}

thread_local! {
    /// Most-recently-used (pool identity, class size) -> class, to avoid the
    /// reader-writer lookup on the hot path.
    static LAST_CLASS: std::cell::RefCell<Option<(usize, usize, Arc<ClassState>)>> =
        std::cell::RefCell::new(None);
}

struct Inner {
    classes: RwLock<HashMap<usize, Arc<ClassState>>>,
    config: BufferPoolConfig,
    effective_max_pool_bytes: AtomicUsize,
    effective_max_buffers_per_class: AtomicUsize,
    total_pooled_bytes: AtomicUsize,
    pressure: AtomicU8,
}

/// A scoped loan of a buffer acquired from a [`BufferPool`].
///
/// The loan derefs to `&[u8]`/`&mut [u8]` of exactly the requested length;
/// dropping it returns the underlying storage to its size class (or frees it
/// outright for unpooled sizes, or when limits are exceeded).
pub struct Loan {
    buf: Vec<u8>,
    requested_len: usize,
    class: Option<Arc<ClassState>>,
    pool: Option<BufferPool>,
}

impl Loan {
    /// The requested length (`<= capacity()`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.requested_len
    }

    /// `true` if the loan's requested length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requested_len == 0
    }

    /// The underlying buffer's full size-class capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl std::ops::Deref for Loan {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf[..self.requested_len]
    }
}

impl std::ops::DerefMut for Loan {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.requested_len]
    }
}

impl Drop for Loan {
    fn drop(&mut self) {
        if let (Some(class), Some(pool)) = (self.class.take(), self.pool.take()) {
            let buf = std::mem::take(&mut self.buf);
            pool.return_buffer(&class, buf);
        }
    }
}

/// A process-wide, size-classed buffer cache.
///
/// Cheap to clone: internally an `Arc` handle over shared state. See module
/// docs and specification §4.2 for the size-class and eviction rules.
#[derive(Clone)]
pub struct BufferPool(Arc<Inner>);

impl BufferPool {
    /// Builds a pool with its own state, not shared with [`global`].
    ///
    /// Seeds a small number of common-size buffers under normal pressure.
    /// Does not start a background pressure monitor; call
    /// [`BufferPool::spawn_monitor`] if one is wanted.
    #[must_use]
    pub fn new(config: BufferPoolConfig) -> Self {
        let pool = Self(Arc::new(Inner {
            classes: RwLock::new(HashMap::new()),
            effective_max_pool_bytes: AtomicUsize::new(config.max_pool_bytes),
            effective_max_buffers_per_class: AtomicUsize::new(config.max_buffers_per_class),
            total_pooled_bytes: AtomicUsize::new(0),
            pressure: AtomicU8::new(PressureLevel::Normal as u8),
            config,
        }));
        pool.preallocate();
        pool
    }

    /// Starts the background memory-pressure monitor for this pool. See
    /// [`monitor`].
    pub fn spawn_monitor(&self) {
        monitor::spawn(self.clone());
    }

    fn preallocate(&self) {
        for &size in PREALLOC_CLASSES {
            let class = self.class_for_size(size);
            let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
            for _ in 0..PREALLOC_COUNT {
                free.push(vec![0u8; size]);
                self.0.total_pooled_bytes.fetch_add(size, Ordering::AcqRel);
            }
        }
    }

    fn class_for(n: usize) -> usize {
        let mut class = MIN_POOLED_SIZE;
        while class < n {
            class *= 2;
        }
        class
    }

    fn class_for_size(&self, size: usize) -> Arc<ClassState> {
        let pool_id = Arc::as_ptr(&self.0) as usize;
        if let Some(cached) = LAST_CLASS.with(|cell| {
            cell.borrow()
                .as_ref()
                .filter(|(id, s, _)| *id == pool_id && *s == size)
                .map(|(_, _, class)| Arc::clone(class))
        }) {
            return cached;
        }

        let found = self.0.classes.read().unwrap_or_else(|e| e.into_inner()).get(&size).cloned();
        let class = found.unwrap_or_else(|| {
            let mut classes = self.0.classes.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                classes
                    .entry(size)
                    .or_insert_with(|| Arc::new(ClassState::new(size))),
            )
        });

        LAST_CLASS.with(|cell| {
            *cell.borrow_mut() = Some((pool_id, size, Arc::clone(&class)));
        });
        class
    }

    /// Acquires a loan of at least `n` bytes.
    ///
    /// Sizes outside `[1 KiB, 1 MiB]` are allocated directly and not pooled.
    /// Never fails under normal operation; the `Result` is reserved for a
    /// future allocator-exhaustion signal.
    pub fn acquire(&self, n: usize) -> Result<Loan> {
        if !(MIN_POOLED_SIZE..=MAX_POOLED_SIZE).contains(&n) {
            return Ok(Loan {
                buf: vec![0u8; n],
                requested_len: n,
                class: None,
                pool: None,
            });
        }

        let class_size = Self::class_for(n);
        let class = self.class_for_size(class_size);
        let popped = {
            let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        let buf = if let Some(buf) = popped {
            class.hits.fetch_add(1, Ordering::Relaxed);
            self.0.total_pooled_bytes.fetch_sub(class_size, Ordering::AcqRel);
            buf
        } else {
            class.misses.fetch_add(1, Ordering::Relaxed);
            vec![0u8; class_size]
        };

        Ok(Loan {
            buf,
            requested_len: n,
            class: Some(class),
            pool: Some(self.clone()),
        })
    }

    fn return_buffer(&self, class: &Arc<ClassState>, buf: Vec<u8>) {
        let max_per_class = self.0.effective_max_buffers_per_class.load(Ordering::Acquire);
        let max_pool = self.0.effective_max_pool_bytes.load(Ordering::Acquire);
        let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
        let current_total = self.0.total_pooled_bytes.load(Ordering::Acquire);
        if free.len() < max_per_class && current_total + class.size <= max_pool {
            free.push(buf);
            self.0.total_pooled_bytes.fetch_add(class.size, Ordering::AcqRel);
        }
        // Otherwise `buf` is simply dropped, freeing its memory.
    }

    /// Current pressure level, as last computed by the background monitor
    /// (or `Normal` if none has run yet).
    #[must_use]
    pub fn pressure(&self) -> PressureLevel {
        PressureLevel::from_u8(self.0.pressure.load(Ordering::Acquire))
    }

    /// Total bytes currently held in free lists across all classes.
    #[must_use]
    pub fn pooled_bytes(&self) -> usize {
        self.0.total_pooled_bytes.load(Ordering::Acquire)
    }

    /// Applies a newly observed pressure level: recomputes effective limits
    /// and evicts if the pool now exceeds them. Called by [`monitor`]; also
    /// usable directly by callers driving their own pressure signal.
    pub fn apply_pressure(&self, level: PressureLevel) {
        self.0.pressure.store(level as u8, Ordering::Release);

        let divisor: usize = match level {
            PressureLevel::Normal => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 4,
        };
        let max_pool = (self.0.config.max_pool_bytes / divisor).min(ABSOLUTE_MAX_POOL_BYTES);
        let max_per_class = (self.0.config.max_buffers_per_class / divisor).max(1);
        self.0.effective_max_pool_bytes.store(max_pool, Ordering::Release);
        self.0
            .effective_max_buffers_per_class
            .store(max_per_class, Ordering::Release);

        if self.0.total_pooled_bytes.load(Ordering::Acquire) > max_pool {
            self.evict_to_fit(level, max_pool);
        }
    }

    /// Forces a one-shot revision of limits when the absolute hard ceiling
    /// has been exceeded: empties the pool and permanently lowers its
    /// configured limits.
    fn collapse_over_ceiling(&self) {
        let mut classes = self.0.classes.write().unwrap_or_else(|e| e.into_inner());
        for class in classes.values() {
            let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
            free.clear();
        }
        classes.clear();
        self.0.total_pooled_bytes.store(0, Ordering::Release);
        self.0
            .effective_max_pool_bytes
            .store(ABSOLUTE_MAX_POOL_BYTES / 2, Ordering::Release);
    }

    fn evict_to_fit(&self, level: PressureLevel, max_pool: usize) {
        if self.0.total_pooled_bytes.load(Ordering::Acquire) > ABSOLUTE_MAX_POOL_BYTES {
            self.collapse_over_ceiling();
            return;
        }

        let factor = level.eviction_factor();
        let mut classes: Vec<Arc<ClassState>> = self
            .0
            .classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        match level {
            PressureLevel::Normal => classes.sort_by(|a, b| b.size.cmp(&a.size)),
            PressureLevel::High | PressureLevel::Critical => {
                classes.sort_by(|a, b| a.hit_rate().partial_cmp(&b.hit_rate()).unwrap());
            }
        }

        let keep_per_class = if level == PressureLevel::Critical { 1 } else { 0 };

        for class in classes {
            if self.0.total_pooled_bytes.load(Ordering::Acquire) <= max_pool {
                break;
            }
            let mut free = class.free.lock().unwrap_or_else(|e| e.into_inner());
            let removable = free.len().saturating_sub(keep_per_class);
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let remove_n = ((removable as f64) * factor).ceil() as usize;
            for _ in 0..remove_n.min(removable) {
                if free.pop().is_some() {
                    self.0.total_pooled_bytes.fetch_sub(class.size, Ordering::AcqRel);
                }
            }
        }
    }
}

/// The process-wide default pool, shared by [`crate::bytestream::HttpStream`]
/// when no explicit pool is supplied, with its background pressure monitor
/// already running.
pub fn global() -> &'static BufferPool {
    static GLOBAL: Lazy<BufferPool> = Lazy::new(|| {
        let pool = BufferPool::new(BufferPoolConfig::default());
        pool.spawn_monitor();
        pool
    });
    &GLOBAL
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pooled_bytes", &self.pooled_bytes())
            .field("pressure", &self.pressure())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_below_min_is_unpooled() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let loan = pool.acquire(16).unwrap();
        assert_eq!(loan.len(), 16);
        assert_eq!(pool.pooled_bytes(), 0);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_pool_bytes: 1024 * 1024,
            max_buffers_per_class: 8,
        });
        let before = pool.pooled_bytes();
        {
            let loan = pool.acquire(4096).unwrap();
            assert_eq!(loan.len(), 4096);
        }
        assert!(pool.pooled_bytes() >= before);
    }

    #[test]
    fn class_rounds_up_to_power_of_two() {
        assert_eq!(BufferPool::class_for(1025), 2048);
        assert_eq!(BufferPool::class_for(4096), 4096);
    }

    #[test]
    fn pressure_shrinks_effective_limits() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_pool_bytes: 16 * 1024 * 1024,
            max_buffers_per_class: 8,
        });
        pool.apply_pressure(PressureLevel::Critical);
        assert_eq!(
            pool.0.effective_max_pool_bytes.load(Ordering::Acquire),
            4 * 1024 * 1024
        );
    }
}
