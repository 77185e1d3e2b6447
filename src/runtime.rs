//! Runtime handle owning the registry, clock and hardware backends.

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::line::LineDriver;
use crate::registry::{PinInfo, Registry};
use crate::timer::{PwmTimer, SoftPwm};
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Occupancy of one I2C bus index.
#[derive(Debug, Default)]
pub(crate) struct BusSlot {
    pub(crate) open: AtomicBool,
    /// Clock microseconds until which the bus must stay idle after a reset.
    pub(crate) quiet_until_us: AtomicU64,
}

pub(crate) struct Inner {
    pub(crate) config: RuntimeConfig,
    pub(crate) clock: Clock,
    pub(crate) registry: Registry,
    pub(crate) lines: Arc<dyn LineDriver>,
    pub(crate) timer: Arc<dyn PwmTimer>,
    pub(crate) buses: Vec<BusSlot>,
    pub(crate) channels: Vec<AtomicBool>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .field("line_count", &self.registry.line_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Marks a bus index open. Returns `false` if it already was.
    pub(crate) fn try_open_bus(&self, bus: u8) -> bool {
        self.buses[bus as usize]
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn close_bus(&self, bus: u8) {
        self.buses[bus as usize].open.store(false, Ordering::Release);
    }

    /// Marks a PWM channel running. Returns `false` if it already was.
    pub(crate) fn try_start_channel(&self, channel: u8) -> bool {
        self.channels[channel as usize]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn stop_channel(&self, channel: u8) {
        self.channels[channel as usize].store(false, Ordering::Release);
    }
}

/// The peripheral I/O runtime.
///
/// One `Runtime` exists per target for the lifetime of the process. It is
/// cheap to clone and safe to share between threads; all clones refer to the
/// same pin registry.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<Inner>,
}

impl Runtime {
    /// Creates a runtime with default configuration and a software PWM timer.
    pub fn new(lines: Arc<dyn LineDriver>) -> Self {
        Self::with_config(lines, RuntimeConfig::default())
    }

    /// Creates a runtime with a software PWM timer.
    pub fn with_config(lines: Arc<dyn LineDriver>, config: RuntimeConfig) -> Self {
        let clock = Clock::new();
        let timer = Arc::new(SoftPwm::new(
            lines.clone(),
            clock,
            config.pwm_channel_count,
        ));
        Self::build(lines, timer, config, clock)
    }

    /// Creates a runtime whose PWM channels are generated by `timer`.
    pub fn with_timer(
        lines: Arc<dyn LineDriver>,
        timer: Arc<dyn PwmTimer>,
        config: RuntimeConfig,
    ) -> Self {
        Self::build(lines, timer, config, Clock::new())
    }

    fn build(
        lines: Arc<dyn LineDriver>,
        timer: Arc<dyn PwmTimer>,
        config: RuntimeConfig,
        clock: Clock,
    ) -> Self {
        let line_count = lines.line_count();
        debug!(
            "Runtime up: {} lines, {} I2C buses, {} PWM channels",
            line_count, config.bus_count, config.pwm_channel_count
        );
        let inner = Inner {
            registry: Registry::new(line_count, clock),
            buses: (0..config.bus_count).map(|_| BusSlot::default()).collect(),
            channels: (0..config.pwm_channel_count)
                .map(|_| AtomicBool::new(false))
                .collect(),
            config,
            clock,
            lines,
            timer,
        };
        Runtime {
            inner: Arc::new(inner),
        }
    }

    /// Gets the configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Gets the runtime clock.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Gets the pin registry.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Diagnostic snapshot of a pin.
    pub fn pin_info(&self, pin: u8) -> Result<PinInfo> {
        self.inner.registry.snapshot(pin)
    }

    // --- Timing ---
    /// Milliseconds since the runtime was created.
    pub fn millis(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Microseconds since the runtime was created.
    pub fn micros(&self) -> u64 {
        self.inner.clock.now_us()
    }

    /// Blocks the calling thread for at least `ms` milliseconds.
    pub fn sleep_ms(&self, ms: u64) {
        self.inner.clock.sleep_ms(ms);
    }

    /// Blocks the calling thread for at least `us` microseconds.
    pub fn sleep_us(&self, us: u64) {
        self.inner.clock.sleep_us(us);
    }
}
