//! Background memory-pressure monitor.
//!
//! Polls process memory usage every 5 seconds and feeds the resulting
//! [`super::PressureLevel`] to a [`super::BufferPool`]. Runs as a dedicated
//! `std::thread` and touches only the pool's public API, never its locks
//! directly.

use std::thread;
use std::time::Duration;

use sysinfo::{Pid, ProcessExt, System, SystemExt};

use super::{BufferPool, PressureLevel};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const HIGH_WATERMARK: f64 = 0.75;
const CRITICAL_WATERMARK: f64 = 0.90;

/// Spawns the monitor thread for `pool`. The thread runs for the lifetime of
/// the process; there is no shutdown handle, matching the pool's own
/// process-wide lifetime.
pub(crate) fn spawn(pool: BufferPool) {
    let result = thread::Builder::new()
        .name("demux-core-pool-monitor".into())
        .spawn(move || run(pool));
    if let Err(e) = result {
        warn!("failed to start buffer pool pressure monitor: {e}");
    }
}

fn run(pool: BufferPool) {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            warn!("buffer pool pressure monitor disabled: could not determine pid ({e})");
            return;
        }
    };
    let mut system = System::new();

    loop {
        thread::sleep(POLL_INTERVAL);
        let level = classify(&mut system, pid);
        pool.apply_pressure(level);
        trace!(
            "pool pressure={level:?} pooled_bytes={}",
            pool.pooled_bytes()
        );
    }
}

fn classify(system: &mut System, pid: Pid) -> PressureLevel {
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return PressureLevel::Normal;
    }

    let used = if system.refresh_process(pid) {
        system.process(pid).map_or(0, ProcessExt::memory)
    } else {
        0
    };

    #[allow(clippy::cast_precision_loss)]
    let ratio = used as f64 / total as f64;
    if ratio >= CRITICAL_WATERMARK {
        PressureLevel::Critical
    } else if ratio >= HIGH_WATERMARK {
        PressureLevel::High
    } else {
        PressureLevel::Normal
    }
}
