//! Runtime configuration.

use std::time::Duration;

/// Default per-byte I2C timeout in milliseconds.
const DEFAULT_BYTE_TIMEOUT_MS: u64 = 25;

/// Timeout and recovery behavior of the I2C driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cTimeouts {
    /// Longest a single byte (including START/STOP) may be held up by SCL
    /// being pulled low before the transfer fails with `Timeout`.
    pub byte_timeout: Duration,
    /// Quiet time enforced on the bus after a forced reset.
    pub reset_idle: Duration,
    /// Maximum SCL pulses clocked out to free a target holding SDA low.
    pub recovery_clocks: u8,
}

impl Default for I2cTimeouts {
    fn default() -> Self {
        I2cTimeouts {
            byte_timeout: Duration::from_millis(DEFAULT_BYTE_TIMEOUT_MS),
            reset_idle: Duration::from_millis(1),
            recovery_clocks: 9,
        }
    }
}

impl I2cTimeouts {
    /// Short limits for buses that only carry fast, well-behaved targets.
    pub fn fast() -> Self {
        I2cTimeouts {
            byte_timeout: Duration::from_millis(5),
            reset_idle: Duration::from_micros(200),
            recovery_clocks: 9,
        }
    }

    /// Generous limits for slow line backends such as a USB bridge, where a
    /// single line access costs a round trip.
    pub fn tolerant() -> Self {
        I2cTimeouts {
            byte_timeout: Duration::from_millis(500),
            reset_idle: Duration::from_millis(10),
            recovery_clocks: 9,
        }
    }
}

/// Accepted PWM frequency range.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmLimits {
    pub min_freq_hz: f64,
    pub max_freq_hz: f64,
}

impl Default for PwmLimits {
    fn default() -> Self {
        PwmLimits {
            min_freq_hz: 0.1,
            max_freq_hz: 100_000.0,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Number of I2C bus indices (`0..bus_count`).
    pub bus_count: u8,
    /// Number of PWM channel indices (`0..pwm_channel_count`).
    pub pwm_channel_count: u8,
    pub i2c: I2cTimeouts,
    pub pwm: PwmLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            bus_count: 2,
            pwm_channel_count: 16,
            i2c: I2cTimeouts::default(),
            pwm: PwmLimits::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_bus_count(mut self, bus_count: u8) -> Self {
        self.bus_count = bus_count;
        self
    }

    pub fn with_pwm_channel_count(mut self, count: u8) -> Self {
        self.pwm_channel_count = count;
        self
    }

    pub fn with_i2c_timeouts(mut self, timeouts: I2cTimeouts) -> Self {
        self.i2c = timeouts;
        self
    }

    pub fn with_pwm_limits(mut self, limits: PwmLimits) -> Self {
        self.pwm = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bus_count, 2);
        assert_eq!(config.pwm_channel_count, 16);
        assert_eq!(config.i2c.byte_timeout, Duration::from_millis(25));
        assert_eq!(config.i2c.recovery_clocks, 9);
    }

    #[test]
    fn test_timeout_presets() {
        let fast = I2cTimeouts::fast();
        let tolerant = I2cTimeouts::tolerant();
        assert!(fast.byte_timeout < I2cTimeouts::default().byte_timeout);
        assert!(tolerant.byte_timeout > I2cTimeouts::default().byte_timeout);
        assert_eq!(fast.recovery_clocks, tolerant.recovery_clocks);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::default()
            .with_bus_count(4)
            .with_pwm_channel_count(2)
            .with_i2c_timeouts(I2cTimeouts::tolerant());
        assert_eq!(config.bus_count, 4);
        assert_eq!(config.pwm_channel_count, 2);
        assert_eq!(config.i2c, I2cTimeouts::tolerant());
    }
}
