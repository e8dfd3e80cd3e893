//! Millisecond tick counters used by the poll scheduler
//!
//! Ticks live in `[0, i32::MAX]` and recycle to `0` once the maximum is passed
//! (roughly every 24.8 days). All elapsed-time arithmetic goes through
//! [`calculate_delta`], which stays correct across the recycle point.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Compute the elapsed ticks between `start` and `now`, tolerating one wraparound.
pub fn calculate_delta(now: i32, start: i32) -> i32 {
    if now >= start {
        return now - start;
    }

    // Widened so the intermediate sum cannot overflow on bad input.
    let delta = (i32::MAX as i64 - start as i64) + (now as i64) + 1;
    delta.clamp(0, i32::MAX as i64) as i32
}

/// Convert a duration to a tick count, saturating at `i32::MAX`
pub fn duration_to_ticks(duration: Duration) -> i32 {
    duration.as_millis().min(i32::MAX as u128) as i32
}

/// Source of the current tick count
pub trait TickSource: Send + Sync + fmt::Debug {
    fn ticks(&self) -> i32;
}

/// Tick source backed by the monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct SystemTickSource {
    origin: Instant,
}

impl SystemTickSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTickSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTickSource {
    fn ticks(&self) -> i32 {
        let elapsed = self.origin.elapsed().as_millis();
        (elapsed & i32::MAX as u128) as i32
    }
}

/// Manually driven tick source for deterministic scheduling
#[derive(Debug, Default)]
pub struct ManualTickSource {
    now: AtomicI32,
}

impl ManualTickSource {
    pub fn new(start: i32) -> Self {
        Self {
            now: AtomicI32::new(start.max(0)),
        }
    }

    pub fn set(&self, ticks: i32) {
        self.now.store(ticks.max(0), Ordering::SeqCst);
    }

    /// Move the clock forward, recycling past `i32::MAX`
    pub fn advance(&self, duration: Duration) {
        let step = duration_to_ticks(duration);
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(((current as i64 + step as i64) % (i32::MAX as i64 + 1)) as i32)
            });
    }
}

impl TickSource for ManualTickSource {
    fn ticks(&self) -> i32 {
        self.now.load(Ordering::SeqCst)
    }
}
