//! A single size class's free list and hit/miss counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub(super) struct ClassState {
    pub(super) size: usize,
    pub(super) free: Mutex<Vec<Vec<u8>>>,
    pub(super) hits: AtomicU64,
    pub(super) misses: AtomicU64,
}

impl ClassState {
    pub(super) fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(super) fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                hits as f64 / total as f64
            }
        }
    }
}
