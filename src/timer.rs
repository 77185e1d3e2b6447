//! Hardware timer abstraction for PWM generation, and a software timer that
//! produces the waveform by toggling lines from a dedicated thread.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gpio::GpioLevel;
use crate::line::LineDriver;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single wait inside a period, so that `stop` is noticed promptly
/// even at very low frequencies.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Frequency and duty of a PWM waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmSettings {
    pub freq_hz: f64,
    /// High-time fraction, 0.0-1.0 inclusive.
    pub duty: f64,
}

/// What one period of the waveform looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodShape {
    /// The line holds one level for the whole period; no edges.
    Hold(GpioLevel),
    /// High for `high`, then low for the rest of `period`.
    Pulse { high: Duration, period: Duration },
}

impl PwmSettings {
    /// Length of one period.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.freq_hz)
    }

    /// High time within one period, rounded to the nearest nanosecond.
    pub fn high_time(&self) -> Duration {
        let period_ns = self.period().as_nanos() as f64;
        Duration::from_nanos((period_ns * self.duty).round() as u64)
    }

    /// Shape of a period at these settings. Duty 0.0 and 1.0 emit no edges.
    pub fn shape(&self) -> PeriodShape {
        let period = self.period();
        let high = self.high_time();
        if high.is_zero() {
            PeriodShape::Hold(GpioLevel::Low)
        } else if high >= period {
            PeriodShape::Hold(GpioLevel::High)
        } else {
            PeriodShape::Pulse { high, period }
        }
    }
}

/// A timer peripheral able to generate PWM on a line.
///
/// Settings passed to `update` must take effect at the next period
/// boundary: the period in progress completes with the previous settings.
pub trait PwmTimer: Send + Sync {
    /// Starts continuous generation on `line` immediately.
    fn start(&self, channel: u8, line: u8, settings: PwmSettings) -> Result<()>;

    /// Changes the settings of a running channel.
    fn update(&self, channel: u8, settings: PwmSettings) -> Result<()>;

    /// Stops generation. On return no further edges are produced and the
    /// line is driven low.
    fn stop(&self, channel: u8) -> Result<()>;
}

/// State shared between a channel handle and its generator thread.
#[derive(Debug)]
struct Latch {
    pending: Mutex<PwmSettings>,
    running: AtomicBool,
    periods: AtomicU64,
}

impl Latch {
    fn settings(&self) -> PwmSettings {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Generator {
    line: u8,
    latch: Arc<Latch>,
    thread: JoinHandle<()>,
}

/// Software PWM: one generator thread per running channel, scheduled on
/// absolute period boundaries so that timing errors never accumulate.
pub struct SoftPwm {
    lines: Arc<dyn LineDriver>,
    clock: Clock,
    slots: Vec<Mutex<Option<Generator>>>,
}

impl SoftPwm {
    pub fn new(lines: Arc<dyn LineDriver>, clock: Clock, channel_count: u8) -> Self {
        SoftPwm {
            lines,
            clock,
            slots: (0..channel_count).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, channel: u8) -> Result<&Mutex<Option<Generator>>> {
        self.slots.get(channel as usize).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "PWM channel {} out of range (0-{})",
                channel,
                self.slots.len().saturating_sub(1)
            ))
        })
    }

    /// Whether the generator of `channel` is still producing its waveform.
    /// `false` once stopped, or after a line error ended it.
    pub fn is_generating(&self, channel: u8) -> bool {
        let Ok(slot) = self.slot(channel) else {
            return false;
        };
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .is_some_and(|generator| generator.latch.running.load(Ordering::Acquire))
    }

    /// Number of periods a running channel has started, `None` if stopped.
    pub fn periods_elapsed(&self, channel: u8) -> Option<u64> {
        let slot = self.slot(channel).ok()?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|generator| generator.latch.periods.load(Ordering::Acquire))
    }
}

impl PwmTimer for SoftPwm {
    fn start(&self, channel: u8, line: u8, settings: PwmSettings) -> Result<()> {
        let mut slot = self
            .slot(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::ChannelBusy { channel });
        }
        let latch = Arc::new(Latch {
            pending: Mutex::new(settings),
            running: AtomicBool::new(true),
            periods: AtomicU64::new(0),
        });
        let waveform = Waveform {
            lines: self.lines.clone(),
            clock: self.clock,
            line,
            latch: latch.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("pwm{}", channel))
            .spawn(move || waveform.run())
            .map_err(|e| Error::HardwareFault(format!("spawning PWM generator: {}", e)))?;
        debug!(
            "Soft PWM channel {} started on line {}: {} Hz, duty {}",
            channel, line, settings.freq_hz, settings.duty
        );
        *slot = Some(Generator {
            line,
            latch,
            thread,
        });
        Ok(())
    }

    fn update(&self, channel: u8, settings: PwmSettings) -> Result<()> {
        let slot = self
            .slot(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let generator = slot.as_ref().ok_or(Error::Closed("PWM"))?;
        if !generator.latch.running.load(Ordering::Acquire) {
            return Err(Error::HardwareFault(format!(
                "PWM generator on line {} stopped after a line error",
                generator.line
            )));
        }
        *generator
            .latch
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        trace!(
            "Soft PWM channel {} pending: {} Hz, duty {}",
            channel,
            settings.freq_hz,
            settings.duty
        );
        Ok(())
    }

    fn stop(&self, channel: u8) -> Result<()> {
        let generator = self
            .slot(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(generator) = generator else {
            return Ok(());
        };
        generator.latch.running.store(false, Ordering::Release);
        if generator.thread.join().is_err() {
            warn!("PWM generator for channel {} panicked", channel);
        }
        self.lines.write(generator.line, GpioLevel::Low)?;
        debug!("Soft PWM channel {} stopped", channel);
        Ok(())
    }
}

/// The generator thread body.
struct Waveform {
    lines: Arc<dyn LineDriver>,
    clock: Clock,
    line: u8,
    latch: Arc<Latch>,
}

impl Waveform {
    fn run(self) {
        let mut driven: Option<GpioLevel> = None;
        let mut period_start = Instant::now();
        while self.latch.running.load(Ordering::Acquire) {
            // Settings are latched once per period.
            let settings = self.latch.settings();
            self.latch.periods.fetch_add(1, Ordering::AcqRel);
            let result = match settings.shape() {
                PeriodShape::Hold(level) => self.drive(&mut driven, level),
                PeriodShape::Pulse { high, .. } => {
                    self.drive(&mut driven, GpioLevel::High).and_then(|_| {
                        self.wait_until(period_start + high);
                        self.drive(&mut driven, GpioLevel::Low)
                    })
                }
            };
            if let Err(e) = result {
                warn!("PWM on line {} stopped by line error: {}", self.line, e);
                self.latch.running.store(false, Ordering::Release);
                return;
            }
            period_start += settings.period();
            self.wait_until(period_start);
            // Resynchronize after a scheduler stall instead of emitting a
            // burst of short catch-up periods.
            let now = Instant::now();
            if now > period_start + settings.period() {
                trace!("PWM on line {} fell behind, resynchronizing", self.line);
                period_start = now;
            }
        }
    }

    fn drive(&self, driven: &mut Option<GpioLevel>, level: GpioLevel) -> Result<()> {
        if *driven != Some(level) {
            self.lines.write(self.line, level)?;
            *driven = Some(level);
        }
        Ok(())
    }

    fn wait_until(&self, deadline: Instant) {
        loop {
            if !self.latch.running.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let slice = (deadline - now).min(MAX_WAIT_SLICE);
            self.clock.delay_until(now + slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_period_and_high_time() {
        let settings = PwmSettings {
            freq_hz: 5000.0,
            duty: 0.25,
        };
        assert_eq!(settings.period(), Duration::from_micros(200));
        assert_eq!(settings.high_time(), Duration::from_micros(50));
    }

    #[test]
    fn test_extreme_duties_hold_level() {
        let low = PwmSettings {
            freq_hz: 1000.0,
            duty: 0.0,
        };
        let high = PwmSettings {
            freq_hz: 1000.0,
            duty: 1.0,
        };
        assert_eq!(low.shape(), PeriodShape::Hold(GpioLevel::Low));
        assert_eq!(high.shape(), PeriodShape::Hold(GpioLevel::High));
    }

    #[test]
    fn test_pulse_shape() {
        let settings = PwmSettings {
            freq_hz: 50.0,
            duty: 0.075,
        };
        match settings.shape() {
            PeriodShape::Pulse { high, period } => {
                assert_eq!(period, Duration::from_millis(20));
                assert_relative_eq!(high.as_secs_f64(), 0.0015, epsilon = 1e-9);
            }
            other => panic!("expected a pulse, got {:?}", other),
        }
    }
}
