//! Tick source for latency measurement
//!
//! This module wraps a monotonic, low-overhead counter behind an opaque
//! tick value. On x86_64 it reads the time stamp counter directly; on
//! other targets it falls back to the OS monotonic clock in nanoseconds,
//! trading absolute precision for portability.

use std::time::{Duration, Instant};

/// An opaque 64-bit tick count from the process-local tick source.
///
/// Tick values are monotonically non-decreasing within a process run and
/// are only meaningful for relative elapsed-time computation. They must
/// not be compared across processes or reboots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickValue(u64);

impl TickValue {
    /// The zero tick value.
    pub const ZERO: TickValue = TickValue(0);

    /// Create a tick value from a raw counter reading.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw counter reading.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the zero tick value.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Ticks elapsed since `earlier`, clamped to zero.
    #[inline]
    pub fn saturating_delta(self, earlier: TickValue) -> TickValue {
        TickValue(self.0.saturating_sub(earlier.0))
    }
}

/// The process-local tick clock.
///
/// Reads are inlined and never block, allocate, log, or make a syscall
/// that could cause a context switch, so a read can be placed directly
/// against a send or receive without distorting the measured interval.
pub struct TickClock;

impl TickClock {
    /// Read the current tick count.
    #[inline]
    pub fn now() -> TickValue {
        TickValue(raw_ticks())
    }

    /// Estimate the tick frequency in ticks per second.
    ///
    /// Measures the counter against the OS monotonic clock over `window`.
    /// This sleeps and must never be called on the measurement path; it
    /// exists so callers can convert tick deltas to wall-clock units.
    pub fn calibrate(window: Duration) -> u64 {
        let t0 = Self::now();
        let wall = Instant::now();
        std::thread::sleep(window);
        let ticks = Self::now().saturating_delta(t0).get();
        let nanos = wall.elapsed().as_nanos().max(1);
        ((ticks as u128).saturating_mul(1_000_000_000) / nanos) as u64
    }
}

/// Raw time stamp counter read.
///
/// Assumes an invariant TSC (constant rate, monotonic per package), which
/// holds on every x86_64 part from the last decade. The read itself costs
/// a few tens of cycles and is not serializing.
#[cfg(target_arch = "x86_64")]
#[inline]
fn raw_ticks() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Portable fallback: nanoseconds of monotonic time since a process-local
/// epoch. Resolution is whatever the OS clock provides (tens of
/// nanoseconds on mainstream kernels) rather than a cycle count.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn raw_ticks() -> u64 {
    static EPOCH: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as u64
}
