//! Line and PWM backend for the MaxLinear/Exar XR2280x USB bridge.
//!
//! The EDGE HID interface of the XR22800/1/2/4 exposes 8 or 32 GPIO lines
//! and two hardware PWM generators through register reads and writes
//! carried in HID feature reports. [`Xr2280xEdge`] implements both
//! [`LineDriver`] and [`PwmTimer`] on top of it:
//!
//! ```no_run
//! use hidapi::HidApi;
//! use periphio::hid::Xr2280xEdge;
//! use periphio::{I2cTimeouts, Runtime, RuntimeConfig};
//! use std::sync::Arc;
//!
//! fn main() -> periphio::Result<()> {
//!     let api = HidApi::new()?;
//!     let edge = Arc::new(Xr2280xEdge::open_first(&api)?);
//!     // Every line access is a USB round trip
//!     let config = RuntimeConfig::default()
//!         .with_pwm_channel_count(2)
//!         .with_i2c_timeouts(I2cTimeouts::tolerant());
//!     let runtime = Runtime::with_timer(edge.clone(), edge, config);
//!     runtime.gpio_set_mode(0, periphio::GpioMode::Output)?;
//!     Ok(())
//! }
//! ```
//!
//! Hardware PWM periods are limited to 1-4095 counter units of ~266.667 ns
//! for each of the high and low phases, so only frequencies from roughly
//! 460 Hz up are representable.

use crate::consts::xr2280x::{self as consts, edge, pwm};
use crate::error::{Error, Result};
use crate::gpio::{GpioLevel, GpioPull};
use crate::line::{LineConfig, LineDriver};
use crate::timer::{PeriodShape, PwmSettings, PwmTimer};
use hidapi::{HidApi, HidDevice};
use log::{debug, trace, warn};
use std::ffi::CStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

const PWM_CHANNELS: usize = 2;

/// Converts nanoseconds to PWM counter units.
fn to_pwm_units(nanoseconds: u64) -> Result<u16> {
    let units = (nanoseconds as f64 / pwm::UNIT_TIME_NS).round() as u64;
    if units < pwm::MIN_UNITS as u64 || units > pwm::MAX_UNITS as u64 {
        return Err(Error::InvalidParameter(format!(
            "PWM phase of {} ns not representable (min {} ns, max {} ns)",
            nanoseconds,
            (pwm::MIN_UNITS as f64 * pwm::UNIT_TIME_NS).round() as u64,
            (pwm::MAX_UNITS as f64 * pwm::UNIT_TIME_NS).round() as u64
        )));
    }
    Ok(units as u16)
}

/// An opened XR2280x EDGE interface.
#[derive(Debug)]
pub struct Xr2280xEdge {
    device: Mutex<HidDevice>,
    line_count: u8,
    /// Line driven by each hardware PWM channel while running.
    pwm_lines: Mutex<[Option<u8>; PWM_CHANNELS]>,
}

impl Xr2280xEdge {
    /// Opens the first EDGE interface with the default VID/PID.
    pub fn open_first(api: &HidApi) -> Result<Self> {
        Self::from_device(api.open(consts::EXAR_VID, consts::EDGE_PID)?)
    }

    /// Opens an EDGE interface by its platform-specific path.
    pub fn open_path(api: &HidApi, path: &CStr) -> Result<Self> {
        Self::from_device(api.open_path(path)?)
    }

    fn from_device(device: HidDevice) -> Result<Self> {
        let mut edge = Xr2280xEdge {
            device: Mutex::new(device),
            line_count: consts::GROUP_SIZE / 2,
            pwm_lines: Mutex::new([None; PWM_CHANNELS]),
        };
        // Group 1 registers only answer on the 32-line parts
        edge.line_count = match edge.read_register(edge::GROUP_1_BASE + edge::FUNC_SEL) {
            Ok(_) => 2 * consts::GROUP_SIZE,
            Err(Error::HardwareFault(_)) => consts::GROUP_SIZE / 2,
            Err(e) => return Err(e),
        };
        debug!("XR2280x EDGE interface open: {} lines", edge.line_count);
        Ok(edge)
    }

    fn device(&self) -> MutexGuard<'_, HidDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pwm_lines(&self) -> MutexGuard<'_, [Option<u8>; PWM_CHANNELS]> {
        self.pwm_lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Register Access ---
    fn write_register(&self, reg_addr: u16, value: u16) -> Result<()> {
        let [addr_lo, addr_hi] = reg_addr.to_le_bytes();
        let [value_lo, value_hi] = value.to_le_bytes();
        let buf = [
            consts::REPORT_ID_WRITE_HID_REGISTER,
            addr_lo,
            addr_hi,
            value_lo,
            value_hi,
        ];
        trace!("Write reg 0x{:04X} = 0x{:04X}", reg_addr, value);
        self.device().send_feature_report(&buf).map_err(|e| {
            trace!("send_feature_report error: {}", e);
            Error::HardwareFault(format!("writing register 0x{:04X} failed", reg_addr))
        })
    }

    fn read_register(&self, reg_addr: u16) -> Result<u16> {
        let [addr_lo, addr_hi] = reg_addr.to_le_bytes();
        let device = self.device();
        device
            .send_feature_report(&[consts::REPORT_ID_SET_HID_READ_ADDRESS, addr_lo, addr_hi])
            .map_err(|e| {
                trace!("send_feature_report error: {}", e);
                Error::HardwareFault(format!("selecting register 0x{:04X} failed", reg_addr))
            })?;
        let mut buf = [consts::REPORT_ID_READ_HID_REGISTER, 0, 0];
        match device.get_feature_report(&mut buf) {
            Ok(len) if len == buf.len() && buf[0] == consts::REPORT_ID_READ_HID_REGISTER => {
                let value = u16::from_le_bytes([buf[1], buf[2]]);
                trace!("Read reg 0x{:04X} = 0x{:04X}", reg_addr, value);
                Ok(value)
            }
            Ok(len) => {
                warn!(
                    "Unexpected read report for 0x{:04X}: {} bytes, ID 0x{:02X}",
                    reg_addr, len, buf[0]
                );
                Err(Error::HardwareFault(format!(
                    "reading register 0x{:04X} failed",
                    reg_addr
                )))
            }
            Err(e) => {
                trace!("get_feature_report error: {}", e);
                Err(Error::HardwareFault(format!(
                    "reading register 0x{:04X} failed",
                    reg_addr
                )))
            }
        }
    }

    /// Sets or clears `mask` in a register, skipping the write if unchanged.
    fn update_bits(&self, reg_addr: u16, mask: u16, set: bool) -> Result<()> {
        let current = self.read_register(reg_addr)?;
        let value = if set { current | mask } else { current & !mask };
        if value != current {
            self.write_register(reg_addr, value)?;
        }
        Ok(())
    }

    /// Register address and bit mask of `line` within its group.
    fn locate(&self, line: u8, offset: u16) -> Result<(u16, u16)> {
        if line >= self.line_count {
            return Err(Error::InvalidPin {
                pin: line,
                line_count: self.line_count,
            });
        }
        let base = if line < consts::GROUP_SIZE {
            edge::GROUP_0_BASE
        } else {
            edge::GROUP_1_BASE
        };
        Ok((base + offset, 1 << (line % consts::GROUP_SIZE)))
    }

    fn set_pull(&self, line: u8, pull: GpioPull) -> Result<()> {
        let (up, mask) = self.locate(line, edge::PULL_UP)?;
        let (down, _) = self.locate(line, edge::PULL_DOWN)?;
        // Clear the opposite pull first so both are never on together
        match pull {
            GpioPull::Up => {
                self.update_bits(down, mask, false)?;
                self.update_bits(up, mask, true)
            }
            GpioPull::Down => {
                self.update_bits(up, mask, false)?;
                self.update_bits(down, mask, true)
            }
            GpioPull::None => {
                self.update_bits(up, mask, false)?;
                self.update_bits(down, mask, false)
            }
        }
    }

    fn ctrl_register(channel: u8) -> Result<u16> {
        match channel {
            0 => Ok(pwm::REG_PWM0_CTRL),
            1 => Ok(pwm::REG_PWM1_CTRL),
            _ => Err(Error::InvalidParameter(format!(
                "XR2280x has PWM channels 0-1, not {}",
                channel
            ))),
        }
    }

    /// Programs a channel for `settings`. Constant levels are produced by
    /// parking the generator and driving the line directly.
    fn apply_pwm(&self, channel: u8, line: u8, settings: PwmSettings) -> Result<()> {
        let ctrl = Self::ctrl_register(channel)?;
        match settings.shape() {
            PeriodShape::Hold(level) => {
                self.pwm_disable(ctrl)?;
                self.write(line, level)
            }
            PeriodShape::Pulse { high, period } => {
                let high_units = to_pwm_units(high.as_nanos() as u64)?;
                let low_units = to_pwm_units((period - high).as_nanos() as u64)?;
                self.write_register(ctrl + pwm::HIGH_OFFSET, high_units)?;
                self.write_register(ctrl + pwm::LOW_OFFSET, low_units)?;
                let current = self.read_register(ctrl)?;
                let value = (current & !(pwm::PIN_MASK | pwm::CMD_MASK))
                    | (line as u16 & pwm::PIN_MASK)
                    | pwm::ENABLE_MASK
                    | (pwm::CMD_FREE_RUN << pwm::CMD_SHIFT);
                debug!(
                    "XR2280x PWM{} on line {}: high={} low={} units",
                    channel, line, high_units, low_units
                );
                self.write_register(ctrl, value)
            }
        }
    }

    fn pwm_disable(&self, ctrl: u16) -> Result<()> {
        let current = self.read_register(ctrl)?;
        let value = (current & !(pwm::ENABLE_MASK | pwm::CMD_MASK))
            | (pwm::CMD_ASSERT_LOW << pwm::CMD_SHIFT);
        self.write_register(ctrl, value)
    }
}

impl LineDriver for Xr2280xEdge {
    fn line_count(&self) -> u8 {
        self.line_count
    }

    fn configure(&self, line: u8, config: LineConfig) -> Result<()> {
        let (func_sel, mask) = self.locate(line, edge::FUNC_SEL)?;
        let (dir, _) = self.locate(line, edge::DIR)?;
        let (open_drain, _) = self.locate(line, edge::OPEN_DRAIN)?;
        let (tri_state, _) = self.locate(line, edge::TRI_STATE)?;
        debug!("XR2280x line {} -> {}", line, config);
        self.update_bits(func_sel, mask, true)?;
        match config {
            LineConfig::Disabled => {
                self.update_bits(dir, mask, false)?;
                self.set_pull(line, GpioPull::None)
            }
            LineConfig::Input(pull) => {
                self.update_bits(dir, mask, false)?;
                self.set_pull(line, pull)
            }
            LineConfig::PushPull | LineConfig::OpenDrain => {
                self.update_bits(open_drain, mask, config == LineConfig::OpenDrain)?;
                self.update_bits(tri_state, mask, false)?;
                self.update_bits(dir, mask, true)
            }
        }
    }

    fn write(&self, line: u8, level: GpioLevel) -> Result<()> {
        let offset = match level {
            GpioLevel::High => edge::SET,
            GpioLevel::Low => edge::CLEAR,
        };
        let (reg, mask) = self.locate(line, offset)?;
        self.write_register(reg, mask)
    }

    fn read(&self, line: u8) -> Result<GpioLevel> {
        let (reg, mask) = self.locate(line, edge::STATE)?;
        Ok(GpioLevel::from(self.read_register(reg)? & mask != 0))
    }
}

impl PwmTimer for Xr2280xEdge {
    fn start(&self, channel: u8, line: u8, settings: PwmSettings) -> Result<()> {
        Self::ctrl_register(channel)?;
        let mut lines = self.pwm_lines();
        if lines[channel as usize].is_some() {
            return Err(Error::ChannelBusy { channel });
        }
        self.apply_pwm(channel, line, settings)?;
        lines[channel as usize] = Some(line);
        Ok(())
    }

    /// The generator reloads its period registers at the end of the
    /// running period, so the update lands on a boundary.
    fn update(&self, channel: u8, settings: PwmSettings) -> Result<()> {
        Self::ctrl_register(channel)?;
        let line = self.pwm_lines()[channel as usize].ok_or(Error::Closed("PWM"))?;
        self.apply_pwm(channel, line, settings)
    }

    fn stop(&self, channel: u8) -> Result<()> {
        let ctrl = Self::ctrl_register(channel)?;
        let Some(line) = self.pwm_lines()[channel as usize].take() else {
            return Ok(());
        };
        self.pwm_disable(ctrl)?;
        self.write(line, GpioLevel::Low)?;
        debug!("XR2280x PWM{} stopped", channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pwm_units_round_trip_range() {
        assert_eq!(to_pwm_units(267).unwrap(), 1);
        assert_eq!(to_pwm_units(1_092_000).unwrap(), 4095);
        assert!(to_pwm_units(100).is_err());
        assert!(to_pwm_units(2_000_000).is_err());
    }
}
