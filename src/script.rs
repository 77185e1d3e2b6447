//! Script-facing bindings.
//!
//! Control scripts call a flat set of functions taking plain integers and
//! numbers, and only ever check for success or failure. [`Bindings`] adapts
//! the [`Runtime`] to that surface: arguments are range-checked, handles are
//! small integers, and every error is logged with its kind and then
//! collapsed to `false` (or `None`).
//!
//! ```
//! use periphio::script::{Bindings, OUTPUT};
//! use periphio::sim::SimBoard;
//! use periphio::Runtime;
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(Arc::new(SimBoard::new(32)));
//! let script = Bindings::new(runtime);
//! assert!(script.gpio_mode(2, OUTPUT));
//! assert!(script.gpio_write(2, true));
//! assert!(script.gpio_write(2, false));
//! ```

use crate::error::{Error, Result};
use crate::gpio::{GpioLevel, GpioMode};
use crate::i2c::I2cBus;
use crate::pwm::PwmOutput;
use crate::runtime::Runtime;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Pin modes accepted by `gpio_mode`
pub const INPUT: i64 = 0;
pub const OUTPUT: i64 = 1;
pub const INPUT_PULLUP: i64 = 2;
pub const INPUT_PULLDOWN: i64 = 3;

/// Opaque reference to an open I2C bus or PWM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Raw value, as handed to the scripting engine.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }
}

type Table<T> = Mutex<HashMap<Handle, Arc<Mutex<T>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Narrows a script integer to a hardware index or byte.
fn narrow<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T> {
    T::try_from(value).map_err(|_| Error::InvalidParameter(format!("{} {} out of range", what, value)))
}

/// Logs the discarded error kind and collapses the result.
fn report<T>(call: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("{} failed ({:?}): {}", call, e.kind(), e);
            None
        }
    }
}

/// The function table exposed to control scripts.
///
/// Handles stay valid until closed; a closed handle is forgotten, so calls
/// through it fail and a second close does nothing.
#[derive(Debug)]
pub struct Bindings {
    runtime: Runtime,
    next_handle: AtomicU32,
    buses: Table<I2cBus>,
    pwms: Table<PwmOutput>,
}

impl Bindings {
    pub fn new(runtime: Runtime) -> Self {
        Bindings {
            runtime,
            next_handle: AtomicU32::new(1),
            buses: Mutex::new(HashMap::new()),
            pwms: Mutex::new(HashMap::new()),
        }
    }

    /// The runtime behind these bindings, for embedders that want the full
    /// error taxonomy.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn allocate(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn bus(&self, handle: Handle) -> Result<Arc<Mutex<I2cBus>>> {
        lock(&self.buses)
            .get(&handle)
            .cloned()
            .ok_or(Error::Closed("I2C"))
    }

    fn pwm(&self, handle: Handle) -> Result<Arc<Mutex<PwmOutput>>> {
        lock(&self.pwms)
            .get(&handle)
            .cloned()
            .ok_or(Error::Closed("PWM"))
    }

    // --- GPIO ---
    /// `mode` is one of [`INPUT`], [`OUTPUT`], [`INPUT_PULLUP`], [`INPUT_PULLDOWN`].
    pub fn gpio_mode(&self, pin: i64, mode: i64) -> bool {
        let result = (|| -> Result<()> {
            let pin = narrow(pin, "pin")?;
            let mode = match mode {
                INPUT => GpioMode::Input,
                OUTPUT => GpioMode::Output,
                INPUT_PULLUP => GpioMode::InputPullUp,
                INPUT_PULLDOWN => GpioMode::InputPullDown,
                other => {
                    return Err(Error::InvalidParameter(format!("unknown pin mode {}", other)))
                }
            };
            self.runtime.gpio_set_mode(pin, mode)
        })();
        report("gpio_mode", result).is_some()
    }

    pub fn gpio_write(&self, pin: i64, level: bool) -> bool {
        let result = narrow(pin, "pin")
            .and_then(|pin| self.runtime.gpio_write(pin, GpioLevel::from(level)));
        report("gpio_write", result).is_some()
    }

    /// Returns the sampled level; `false` also when the read fails.
    pub fn gpio_read(&self, pin: i64) -> bool {
        let result = narrow(pin, "pin").and_then(|pin| self.runtime.gpio_read(pin));
        report("gpio_read", result).is_some_and(GpioLevel::is_high)
    }

    // --- I2C ---
    pub fn i2c_open(&self, bus: i64, scl: i64, sda: i64, speed: i64) -> Option<Handle> {
        let result = (|| -> Result<Handle> {
            let bus = self.runtime.i2c_open(
                narrow(bus, "bus")?,
                narrow(scl, "SCL pin")?,
                narrow(sda, "SDA pin")?,
                narrow(speed, "I2C speed")?,
            )?;
            let handle = self.allocate();
            lock(&self.buses).insert(handle, Arc::new(Mutex::new(bus)));
            Ok(handle)
        })();
        report("i2c_open", result)
    }

    pub fn i2c_write(&self, handle: Handle, address: i64, bytes: &[i64]) -> bool {
        let result = (|| -> Result<()> {
            let address = narrow(address, "I2C address")?;
            let bytes = bytes
                .iter()
                .map(|&byte| narrow(byte, "byte"))
                .collect::<Result<Vec<u8>>>()?;
            let bus = self.bus(handle)?;
            let mut bus = lock(&bus);
            bus.write(address, &bytes)
        })();
        report("i2c_write", result).is_some()
    }

    /// Returns exactly `length` bytes, or `None`.
    pub fn i2c_read(&self, handle: Handle, address: i64, length: i64) -> Option<Vec<u8>> {
        let result = (|| -> Result<Vec<u8>> {
            let address = narrow(address, "I2C address")?;
            let length = narrow(length, "read length")?;
            let bus = self.bus(handle)?;
            let mut bus = lock(&bus);
            bus.read(address, length)
        })();
        report("i2c_read", result)
    }

    /// Releases the bus pins. Unknown or already closed handles are ignored.
    pub fn i2c_close(&self, handle: Handle) {
        let removed = lock(&self.buses).remove(&handle);
        if let Some(bus) = removed {
            lock(&bus).close();
        }
    }

    // --- PWM ---
    pub fn pwm_open(&self, channel: i64, pin: i64, freq_hz: f64, duty: f64) -> Option<Handle> {
        let result = (|| -> Result<Handle> {
            let output = self.runtime.pwm_open(
                narrow(channel, "PWM channel")?,
                narrow(pin, "pin")?,
                freq_hz,
                duty,
            )?;
            let handle = self.allocate();
            lock(&self.pwms).insert(handle, Arc::new(Mutex::new(output)));
            Ok(handle)
        })();
        report("pwm_open", result)
    }

    pub fn pwm_set(&self, handle: Handle, duty: f64) -> bool {
        let result = self
            .pwm(handle)
            .and_then(|output| {
                let mut output = lock(&output);
                output.set_duty(duty)
            });
        report("pwm_set", result).is_some()
    }

    /// Stops the channel and drives its pin low. Closing twice is a no-op.
    pub fn pwm_close(&self, handle: Handle) {
        let removed = lock(&self.pwms).remove(&handle);
        if let Some(output) = removed {
            lock(&output).close();
        }
    }

    // --- Timing ---
    /// Negative durations do not block.
    pub fn sleep_ms(&self, duration: i64) {
        self.runtime.sleep_ms(duration.max(0) as u64);
    }

    pub fn millis(&self) -> i64 {
        i64::try_from(self.runtime.millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow() {
        assert_eq!(narrow::<u8>(255, "pin").unwrap(), 255);
        assert!(narrow::<u8>(256, "pin").is_err());
        assert!(narrow::<u8>(-1, "pin").is_err());
        assert!(narrow::<usize>(-2, "length").is_err());
    }

    #[test]
    fn test_report_collapses_errors() {
        assert_eq!(report("ok", Ok(3)), Some(3));
        assert_eq!(report::<u8>("err", Err(Error::Closed("PWM"))), None);
    }
}
