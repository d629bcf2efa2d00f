//! Timestamp sources.
//!
//! Request timestamps are raw ticks. A [`ClockRate`] is taken once from the
//! clock that produced them and handed to every conversion, so reports never
//! depend on a process-wide frequency.

use std::time::Duration;

/// Ticks per second of a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockRate {
    ticks_per_sec: f64,
}

impl ClockRate {
    /// One tick per nanosecond.
    pub const NANOS: ClockRate = ClockRate {
        ticks_per_sec: 1e9,
    };

    pub fn new(ticks_per_sec: f64) -> Self {
        assert!(ticks_per_sec > 0.0, "clock rate must be positive");
        Self { ticks_per_sec }
    }

    pub fn ticks_per_sec(self) -> f64 {
        self.ticks_per_sec
    }

    pub fn ticks_to_us(self, ticks: u64) -> f64 {
        ticks as f64 * 1e6 / self.ticks_per_sec
    }

    pub fn ticks_to_secs(self, ticks: u64) -> f64 {
        ticks as f64 / self.ticks_per_sec
    }
}

/// A monotonic tick source.
pub trait Clock {
    fn now(&self) -> u64;
    fn rate(&self) -> ClockRate;
}

/// Nanoseconds since construction.
#[derive(Clone, Copy)]
pub struct MonotonicClock {
    anchor: minstant::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: minstant::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }

    fn rate(&self) -> ClockRate {
        ClockRate::NANOS
    }
}

/// Raw time-stamp counter, calibrated against the monotonic clock.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    rate: ClockRate,
}

#[cfg(target_arch = "x86_64")]
impl TscClock {
    /// Measure the counter frequency over `window`.
    pub fn calibrate(window: Duration) -> Self {
        let wall = minstant::Instant::now();
        let begin = read_tsc();
        std::thread::sleep(window);
        let end = read_tsc();
        let elapsed = wall.elapsed().as_secs_f64();
        let rate = ClockRate::new((end.wrapping_sub(begin)) as f64 / elapsed);
        tracing::debug!(
            "calibrated TSC at {:.3} GHz over {:?}",
            rate.ticks_per_sec() / 1e9,
            window
        );
        Self { rate }
    }
}

#[cfg(target_arch = "x86_64")]
impl Clock for TscClock {
    #[inline]
    fn now(&self) -> u64 {
        read_tsc()
    }

    fn rate(&self) -> ClockRate {
        self.rate
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn read_tsc() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 CPU.
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

/// Default calibration window for [`TscClock`].
pub const TSC_CALIBRATION: Duration = Duration::from_millis(100);
