//! Monotonic time source and blocking delays.

use std::thread;
use std::time::{Duration, Instant};

/// Remaining time below which `delay_until` stops sleeping and starts
/// polling. OS sleeps routinely overshoot by tens of microseconds.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Monotonic clock anchored at runtime start.
///
/// Cheap to copy; every copy shares the same epoch so `now_ms` values from
/// different drivers are directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Creates a clock whose epoch is "now".
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the epoch. Never decreases.
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Microseconds elapsed since the epoch. Never decreases.
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Converts a point in time to microseconds since the epoch.
    pub fn micros_at(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    /// Returns the instant `micros` microseconds after the epoch.
    pub fn instant_at(&self, micros: u64) -> Instant {
        self.epoch + Duration::from_micros(micros)
    }

    /// Blocks the calling thread for at least `ms` milliseconds.
    pub fn sleep_ms(&self, ms: u64) {
        self.sleep(Duration::from_millis(ms));
    }

    /// Blocks the calling thread for at least `us` microseconds.
    pub fn sleep_us(&self, us: u64) {
        self.sleep(Duration::from_micros(us));
    }

    /// Blocks for at least `duration`, yielding the CPU to the scheduler.
    ///
    /// `thread::sleep` may wake early on some platforms, so the remaining
    /// time is re-checked against an absolute deadline.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(deadline - now);
        }
    }

    /// High-resolution wait used for bit and waveform timing.
    ///
    /// Sleeps while the deadline is far away, then polls with
    /// `thread::yield_now` so that other runnable threads are not starved.
    pub fn delay_until(&self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let remaining = deadline - now;
            if remaining > SPIN_THRESHOLD {
                thread::sleep(remaining - SPIN_THRESHOLD);
            } else {
                thread::yield_now();
            }
        }
    }

    /// High-resolution relative wait, see [`Clock::delay_until`].
    pub fn delay(&self, duration: Duration) {
        if !duration.is_zero() {
            self.delay_until(Instant::now() + duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_ms_advances_millis() {
        let clock = Clock::new();
        let mut last = clock.now_ms();
        for _ in 0..3 {
            clock.sleep_ms(20);
            let now = clock.now_ms();
            assert!(now >= last + 20, "expected >= {}, got {}", last + 20, now);
            last = now;
        }
    }

    #[test]
    fn test_copies_share_epoch() {
        let clock = Clock::new();
        let copy = clock;
        clock.sleep_ms(5);
        let a = clock.now_us();
        let b = copy.now_us();
        assert!(b >= a);
        assert!(b - a < 1_000_000);
    }

    #[test]
    fn test_delay_waits_at_least_duration() {
        let clock = Clock::new();
        let start = Instant::now();
        clock.delay(Duration::from_micros(500));
        assert!(start.elapsed() >= Duration::from_micros(500));
    }

    #[test]
    fn test_instant_round_trip() {
        let clock = Clock::new();
        let at = clock.instant_at(1_500);
        assert_eq!(clock.micros_at(at), 1_500);
    }
}
