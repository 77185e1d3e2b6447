//! GPIO driver: pin direction and level control.

use crate::error::Result;
use crate::line::LineConfig;
use crate::registry::{Owner, PinMode};
use crate::runtime::Runtime;
use log::{debug, trace};
use std::fmt;
use std::ops::Not;

/// Requested GPIO configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    Input,
    InputPullUp,
    InputPullDown,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioLevel {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioPull {
    None,
    Up,
    Down,
}

impl GpioMode {
    /// The registry mode a pin takes when configured this way.
    pub fn pin_mode(self) -> PinMode {
        match self {
            GpioMode::Input => PinMode::Input(GpioPull::None),
            GpioMode::InputPullUp => PinMode::Input(GpioPull::Up),
            GpioMode::InputPullDown => PinMode::Input(GpioPull::Down),
            GpioMode::Output => PinMode::Output,
        }
    }
}

impl GpioLevel {
    #[inline]
    pub fn is_high(self) -> bool {
        self == GpioLevel::High
    }
}

impl From<bool> for GpioLevel {
    fn from(value: bool) -> Self {
        if value {
            GpioLevel::High
        } else {
            GpioLevel::Low
        }
    }
}

impl From<GpioLevel> for bool {
    fn from(level: GpioLevel) -> Self {
        level.is_high()
    }
}

impl Not for GpioLevel {
    type Output = GpioLevel;

    fn not(self) -> GpioLevel {
        match self {
            GpioLevel::Low => GpioLevel::High,
            GpioLevel::High => GpioLevel::Low,
        }
    }
}

impl fmt::Display for GpioLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpioLevel::Low => write!(f, "low"),
            GpioLevel::High => write!(f, "high"),
        }
    }
}

impl Runtime {
    // --- GPIO Methods ---
    /// Claims a pin for GPIO use in the requested mode.
    ///
    /// Calling this again on a pin the GPIO driver already owns changes its
    /// mode. A pin held by an I2C bus or PWM channel fails with `Busy`.
    /// Switching to `Output` drives the line low.
    pub fn gpio_set_mode(&self, pin: u8, mode: GpioMode) -> Result<()> {
        let lines = &self.inner.lines;
        let target = mode.pin_mode();
        self.inner
            .registry
            .claim_or_switch(pin, target, Owner::Gpio, |previous| {
                if previous == target {
                    trace!("Pin {} already {}", pin, target);
                    return Ok(None);
                }
                match mode {
                    GpioMode::Output => {
                        lines.write(pin, GpioLevel::Low)?;
                        lines.configure(pin, LineConfig::PushPull)?;
                        Ok(Some(GpioLevel::Low))
                    }
                    GpioMode::Input => {
                        lines.configure(pin, LineConfig::Input(GpioPull::None))?;
                        Ok(None)
                    }
                    GpioMode::InputPullUp => {
                        lines.configure(pin, LineConfig::Input(GpioPull::Up))?;
                        Ok(None)
                    }
                    GpioMode::InputPullDown => {
                        lines.configure(pin, LineConfig::Input(GpioPull::Down))?;
                        Ok(None)
                    }
                }
            })?;
        debug!("GPIO pin {} set to {:?}", pin, mode);
        Ok(())
    }

    /// Drives an output pin. Fails with `InvalidMode` unless the pin is an output.
    pub fn gpio_write(&self, pin: u8, level: GpioLevel) -> Result<()> {
        let lines = &self.inner.lines;
        self.inner
            .registry
            .set_level(pin, level, |level| lines.write(pin, level))?;
        trace!("GPIO pin {} -> {}", pin, level);
        Ok(())
    }

    /// Samples an input pin. Fails with `InvalidMode` unless the pin is an input.
    pub fn gpio_read(&self, pin: u8) -> Result<GpioLevel> {
        let lines = &self.inner.lines;
        let level = self.inner.registry.read_level(pin, || lines.read(pin))?;
        trace!("GPIO pin {} reads {}", pin, level);
        Ok(level)
    }

    /// Returns the level last driven on an output pin.
    pub fn gpio_output_level(&self, pin: u8) -> Result<GpioLevel> {
        self.inner.registry.output_level(pin)
    }

    /// Returns a GPIO-owned pin to `Unclaimed`, leaving the line high impedance.
    ///
    /// Returns `Ok(false)` if the pin was not held by the GPIO driver.
    pub fn gpio_release(&self, pin: u8) -> Result<bool> {
        let lines = &self.inner.lines;
        let released = self
            .inner
            .registry
            .release_owned(pin, Owner::Gpio, || lines.configure(pin, LineConfig::Disabled))?;
        if released {
            debug!("GPIO pin {} released", pin);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversions() {
        assert_eq!(GpioLevel::from(true), GpioLevel::High);
        assert_eq!(GpioLevel::from(false), GpioLevel::Low);
        assert!(bool::from(GpioLevel::High));
        assert_eq!(!GpioLevel::Low, GpioLevel::High);
    }

    #[test]
    fn test_mode_maps_to_pin_mode() {
        assert_eq!(GpioMode::Output.pin_mode(), PinMode::Output);
        assert_eq!(
            GpioMode::InputPullUp.pin_mode(),
            PinMode::Input(GpioPull::Up)
        );
        assert_eq!(GpioMode::Input.pin_mode(), PinMode::Input(GpioPull::None));
    }
}
