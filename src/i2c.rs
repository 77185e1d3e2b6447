//! I2C bus driver: bit-banged master on two open-drain lines.

use crate::clock::Clock;
use crate::consts;
use crate::error::{AckStage, BusFaultReason, Error, Result};
use crate::gpio::GpioLevel;
use crate::line::{LineConfig, LineDriver};
use crate::registry::{ClaimToken, Owner, PinMode};
use crate::runtime::{Inner, Runtime};
use log::{debug, trace, warn};
use std::ops::RangeInclusive;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Largest single read or write accepted, in bytes.
pub const MAX_TRANSFER_LEN: usize = 4096;

/// Standard address range checked by [`I2cBus::scan_default`], skipping the
/// reserved addresses at both ends.
pub const SCAN_RANGE: RangeInclusive<u8> = 0x08..=0x77;

/// SCL low and high times derived from a requested bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    pub low: Duration,
    pub high: Duration,
}

impl BusTiming {
    /// Splits the clock period evenly, then stretches each half to the
    /// minimum the I2C mode for that rate requires.
    pub fn from_speed_hz(speed_hz: u32) -> Result<Self> {
        if speed_hz == 0 || speed_hz > consts::i2c::FAST_MODE_PLUS_HZ {
            return Err(Error::InvalidParameter(format!(
                "I2C speed {} Hz out of range (1-{})",
                speed_hz,
                consts::i2c::FAST_MODE_PLUS_HZ
            )));
        }
        let period_ns = 1_000_000_000u64 / speed_hz as u64;
        let low_ns = period_ns - period_ns / 2;
        let high_ns = period_ns / 2;
        let (min_low, min_high) = if speed_hz <= consts::i2c::STANDARD_MODE_HZ {
            (
                consts::i2c::STANDARD_MIN_LOW_NS,
                consts::i2c::STANDARD_MIN_HIGH_NS,
            )
        } else if speed_hz <= consts::i2c::FAST_MODE_HZ {
            (consts::i2c::FAST_MIN_LOW_NS, consts::i2c::FAST_MIN_HIGH_NS)
        } else {
            (
                consts::i2c::FAST_PLUS_MIN_LOW_NS,
                consts::i2c::FAST_PLUS_MIN_HIGH_NS,
            )
        };
        Ok(BusTiming {
            low: Duration::from_nanos(low_ns.max(min_low)),
            high: Duration::from_nanos(high_ns.max(min_high)),
        })
    }

    /// One full SCL period.
    pub fn period(&self) -> Duration {
        self.low + self.high
    }

    /// The bit rate actually produced, at most the requested one.
    pub fn effective_hz(&self) -> u32 {
        (1_000_000_000u128 / self.period().as_nanos().max(1)) as u32
    }
}

fn check_address(address: u8) -> Result<()> {
    if address > 0x7F {
        return Err(Error::InvalidParameter(format!(
            "7-bit I2C address 0x{:02X} out of range (0x00-0x7F)",
            address
        )));
    }
    Ok(())
}

fn check_length(len: usize) -> Result<()> {
    if len > MAX_TRANSFER_LEN {
        return Err(Error::InvalidParameter(format!(
            "I2C transfer of {} bytes exceeds {} bytes",
            len, MAX_TRANSFER_LEN
        )));
    }
    Ok(())
}

/// Low-level bus conditions, mapped to [`Error`] once the bus is cleaned up.
#[derive(Debug)]
enum Fault {
    Nack(AckStage),
    Timeout,
    Bus(BusFaultReason),
    Line(Error),
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault::Line(e)
    }
}

type Step<T> = std::result::Result<T, Fault>;

/// Bit-level access to the two bus lines for the duration of one transfer.
struct Wire<'a> {
    lines: &'a dyn LineDriver,
    clock: &'a Clock,
    scl: u8,
    sda: u8,
    timing: BusTiming,
    byte_timeout: Duration,
    deadline: Instant,
}

impl Wire<'_> {
    /// Starts the per-byte timeout window.
    fn arm(&mut self) {
        self.deadline = Instant::now() + self.byte_timeout;
    }

    fn sda(&self) -> Step<GpioLevel> {
        Ok(self.lines.read(self.sda)?)
    }

    fn set_sda(&self, level: GpioLevel) -> Step<()> {
        Ok(self.lines.write(self.sda, level)?)
    }

    fn scl_low(&self) -> Step<()> {
        Ok(self.lines.write(self.scl, GpioLevel::Low)?)
    }

    /// Releases SCL and waits for it to actually rise. A target may hold it
    /// low (clock stretching) until the byte deadline.
    fn scl_release(&self) -> Step<()> {
        self.lines.write(self.scl, GpioLevel::High)?;
        loop {
            if self.lines.read(self.scl)? == GpioLevel::High {
                return Ok(());
            }
            if Instant::now() >= self.deadline {
                return Err(Fault::Timeout);
            }
            thread::yield_now();
        }
    }

    /// START, or repeated START when called mid-transfer with SCL low.
    fn start(&mut self) -> Step<()> {
        self.arm();
        self.set_sda(GpioLevel::High)?;
        self.clock.delay(self.timing.low);
        self.scl_release()?;
        self.clock.delay(self.timing.high);
        if self.sda()? == GpioLevel::Low {
            return Err(Fault::Bus(BusFaultReason::ArbitrationLost));
        }
        self.set_sda(GpioLevel::Low)?;
        self.clock.delay(self.timing.high);
        self.scl_low()?;
        trace!("I2C START on SCL={} SDA={}", self.scl, self.sda);
        Ok(())
    }

    /// STOP. Leaves both lines released.
    fn stop(&mut self) -> Step<()> {
        self.arm();
        self.scl_low()?;
        self.set_sda(GpioLevel::Low)?;
        self.clock.delay(self.timing.low);
        self.scl_release()?;
        self.clock.delay(self.timing.high);
        self.set_sda(GpioLevel::High)?;
        self.clock.delay(self.timing.low);
        if self.sda()? == GpioLevel::Low {
            return Err(Fault::Bus(BusFaultReason::ArbitrationLost));
        }
        trace!("I2C STOP on SCL={} SDA={}", self.scl, self.sda);
        Ok(())
    }

    /// Clocks one bit out. Entered and left with SCL low.
    fn write_bit(&self, bit: bool) -> Step<()> {
        self.set_sda(GpioLevel::from(bit))?;
        self.clock.delay(self.timing.low);
        self.scl_release()?;
        if bit && self.sda()? == GpioLevel::Low {
            return Err(Fault::Bus(BusFaultReason::ArbitrationLost));
        }
        self.clock.delay(self.timing.high);
        self.scl_low()
    }

    /// Clocks one bit in. Entered and left with SCL low.
    fn read_bit(&self) -> Step<bool> {
        self.set_sda(GpioLevel::High)?;
        self.clock.delay(self.timing.low);
        self.scl_release()?;
        self.clock.delay(self.timing.high);
        let bit = self.sda()?.is_high();
        self.scl_low()?;
        Ok(bit)
    }

    /// Sends a byte MSB first and returns whether the target acknowledged.
    fn write_byte(&mut self, byte: u8) -> Step<bool> {
        self.arm();
        for shift in (0..8).rev() {
            self.write_bit(byte >> shift & 1 == 1)?;
        }
        let acked = !self.read_bit()?;
        trace!("I2C byte 0x{:02X} {}", byte, if acked { "ACK" } else { "NACK" });
        Ok(acked)
    }

    /// Receives a byte MSB first, then sends ACK (more to come) or NACK.
    fn read_byte(&mut self, ack: bool) -> Step<u8> {
        self.arm();
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = byte << 1 | self.read_bit()? as u8;
        }
        self.write_bit(!ack)?;
        trace!("I2C read 0x{:02X}, sent {}", byte, if ack { "ACK" } else { "NACK" });
        Ok(byte)
    }

    fn address(&mut self, address: u8, read: bool) -> Step<()> {
        if self.write_byte(address << 1 | read as u8)? {
            Ok(())
        } else {
            Err(Fault::Nack(AckStage::Address))
        }
    }

    /// Makes sure the bus is idle before a START. SCL held low runs into the
    /// byte timeout; SDA held low is cleared by the recovery sequence.
    fn ensure_idle(&mut self, recovery_clocks: u8) -> Step<()> {
        self.arm();
        self.scl_release()?;
        if self.sda()? == GpioLevel::High {
            return Ok(());
        }
        warn!(
            "I2C SDA (line {}) held low before START, clocking out recovery",
            self.sda
        );
        match self.recover(recovery_clocks) {
            Ok(()) | Err(Fault::Bus(_)) => {}
            Err(fault) => return Err(fault),
        }
        if self.sda()? == GpioLevel::Low {
            return Err(Fault::Bus(BusFaultReason::SdaStuckLow));
        }
        Ok(())
    }

    /// Pulses SCL until a target holding SDA low finishes its byte and
    /// lets go, then issues STOP. A target still sending a read may pull
    /// SDA low again during the STOP; clocking then resumes. Every STOP
    /// attempt counts against `recovery_clocks`.
    fn recover(&mut self, recovery_clocks: u8) -> Step<()> {
        self.set_sda(GpioLevel::High)?;
        let mut clocks = 0;
        loop {
            if self.sda()? == GpioLevel::High {
                match self.stop() {
                    Err(Fault::Bus(_)) if clocks < recovery_clocks => {
                        trace!("I2C STOP lost to a sending target, clocking on");
                    }
                    result => return result,
                }
            } else if clocks >= recovery_clocks {
                return self.stop();
            } else {
                self.arm();
                self.scl_low()?;
                self.clock.delay(self.timing.low);
                self.scl_release()?;
                self.clock.delay(self.timing.high);
            }
            clocks += 1;
        }
    }

    /// Best-effort reset after a failed transfer: free SDA, STOP, release
    /// both lines. Failures here are logged, the original error wins.
    fn reset(&mut self, recovery_clocks: u8) {
        if let Err(fault) = self.recover(recovery_clocks) {
            warn!("I2C bus reset incomplete: {:?}", fault);
        }
        let _ = self.lines.write(self.sda, GpioLevel::High);
        let _ = self.lines.write(self.scl, GpioLevel::High);
    }
}

/// An open I2C bus.
///
/// Holds exclusive claims on its SCL and SDA pins until closed or dropped.
/// Transfers take `&mut self`, so operations through one handle are applied
/// in issue order.
#[derive(Debug)]
pub struct I2cBus {
    inner: Arc<Inner>,
    bus: u8,
    scl: ClaimToken,
    sda: ClaimToken,
    timing: BusTiming,
    open: bool,
}

impl Runtime {
    // --- I2C Methods ---
    /// Opens bus `bus` on the given SCL/SDA pins at `speed_hz`.
    ///
    /// Fails with `Busy` if the bus index is already open or either pin is
    /// claimed; no claim is left behind in that case. Waits out the idle
    /// period of a previous reset of this bus before returning.
    pub fn i2c_open(&self, bus: u8, scl: u8, sda: u8, speed_hz: u32) -> Result<I2cBus> {
        let inner = &self.inner;
        if bus >= inner.config.bus_count {
            return Err(Error::InvalidParameter(format!(
                "I2C bus {} out of range (0-{})",
                bus,
                inner.config.bus_count.saturating_sub(1)
            )));
        }
        if scl == sda {
            return Err(Error::InvalidParameter(format!(
                "SCL and SDA must be different pins (both {})",
                scl
            )));
        }
        let timing = BusTiming::from_speed_hz(speed_hz)?;
        if !inner.try_open_bus(bus) {
            return Err(Error::BusBusy { bus });
        }
        match self.claim_bus_lines(bus, scl, sda) {
            Ok((scl_token, sda_token)) => {
                let handle = I2cBus {
                    inner: inner.clone(),
                    bus,
                    scl: scl_token,
                    sda: sda_token,
                    timing,
                    open: true,
                };
                handle.wait_quiet();
                debug!(
                    "I2C bus {} open: SCL={} SDA={} ~{} Hz (low {:?}, high {:?})",
                    bus,
                    scl,
                    sda,
                    timing.effective_hz(),
                    timing.low,
                    timing.high
                );
                Ok(handle)
            }
            Err(e) => {
                inner.close_bus(bus);
                Err(e)
            }
        }
    }

    fn claim_bus_lines(&self, bus: u8, scl: u8, sda: u8) -> Result<(ClaimToken, ClaimToken)> {
        let inner = &self.inner;
        let owner = Owner::I2c { bus };
        let lines = &inner.lines;
        let open_drain = |pin: u8| {
            move || {
                lines.write(pin, GpioLevel::High)?;
                lines.configure(pin, LineConfig::OpenDrain)
            }
        };
        let scl_token = inner
            .registry
            .claim_with(scl, PinMode::I2c, owner, open_drain(scl))?;
        match inner
            .registry
            .claim_with(sda, PinMode::I2c, owner, open_drain(sda))
        {
            Ok(sda_token) => Ok((scl_token, sda_token)),
            Err(e) => {
                debug!("I2C bus {}: SDA claim failed, rolling back SCL", bus);
                inner.registry.release_with(&scl_token, || {
                    lines.configure(scl, LineConfig::Disabled)
                });
                Err(e)
            }
        }
    }
}

impl I2cBus {
    /// Bus index.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// SCL pin.
    pub fn scl(&self) -> u8 {
        self.scl.pin()
    }

    /// SDA pin.
    pub fn sda(&self) -> u8 {
        self.sda.pin()
    }

    /// Bit timing in use.
    pub fn timing(&self) -> BusTiming {
        self.timing
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Writes `bytes` to the target at 7-bit `address`.
    ///
    /// An empty `bytes` only checks that the address acknowledges.
    pub fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        check_address(address)?;
        check_length(bytes.len())?;
        debug!(
            "I2C bus {} write {} bytes to 0x{:02X}",
            self.bus,
            bytes.len(),
            address
        );
        self.transfer(address, |wire| {
            wire.address(address, false)?;
            for (index, &byte) in bytes.iter().enumerate() {
                if !wire.write_byte(byte)? {
                    return Err(Fault::Nack(AckStage::Data(index)));
                }
            }
            Ok(())
        })
    }

    /// Reads exactly `length` bytes from the target at 7-bit `address`.
    ///
    /// On any failure the partially received data is discarded.
    pub fn read(&mut self, address: u8, length: usize) -> Result<Vec<u8>> {
        check_address(address)?;
        Self::check_read_length(length)?;
        debug!(
            "I2C bus {} read {} bytes from 0x{:02X}",
            self.bus, length, address
        );
        self.transfer(address, |wire| {
            wire.address(address, true)?;
            Self::read_bytes(wire, length)
        })
    }

    /// Writes `bytes`, then reads `length` bytes after a repeated START,
    /// without releasing the bus in between.
    pub fn write_read(&mut self, address: u8, bytes: &[u8], length: usize) -> Result<Vec<u8>> {
        check_address(address)?;
        check_length(bytes.len())?;
        Self::check_read_length(length)?;
        debug!(
            "I2C bus {} write {} / read {} bytes at 0x{:02X}",
            self.bus,
            bytes.len(),
            length,
            address
        );
        self.transfer(address, |wire| {
            wire.address(address, false)?;
            for (index, &byte) in bytes.iter().enumerate() {
                if !wire.write_byte(byte)? {
                    return Err(Fault::Nack(AckStage::Data(index)));
                }
            }
            wire.start()?;
            wire.address(address, true)?;
            Self::read_bytes(wire, length)
        })
    }

    /// Tries each address in `range` and returns those that acknowledge.
    ///
    /// Addresses that do not acknowledge are skipped; any other failure
    /// aborts the scan.
    pub fn scan(&mut self, range: RangeInclusive<u8>) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for address in range {
            check_address(address)?;
            match self.write(address, &[]) {
                Ok(()) => found.push(address),
                Err(Error::NoAck { .. }) => {}
                Err(e) => {
                    debug!("Scan of bus {} aborted at 0x{:02X}: {}", self.bus, address, e);
                    return Err(e);
                }
            }
        }
        debug!("Scan of bus {} found {:02X?}", self.bus, found);
        Ok(found)
    }

    /// Scans the standard 7-bit range (0x08-0x77).
    pub fn scan_default(&mut self) -> Result<Vec<u8>> {
        self.scan(SCAN_RANGE)
    }

    /// Releases both pins back to `Unclaimed`. Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let lines = &self.inner.lines;
        let (scl, sda) = (self.scl.pin(), self.sda.pin());
        self.inner.registry.release_with(&self.sda, || {
            lines.configure(sda, LineConfig::Disabled)
        });
        self.inner.registry.release_with(&self.scl, || {
            lines.configure(scl, LineConfig::Disabled)
        });
        self.inner.close_bus(self.bus);
        debug!("I2C bus {} closed", self.bus);
    }

    fn check_read_length(length: usize) -> Result<()> {
        if length == 0 {
            return Err(Error::InvalidParameter(
                "I2C read length must be at least 1".to_string(),
            ));
        }
        check_length(length)
    }

    fn read_bytes(wire: &mut Wire<'_>, length: usize) -> Step<Vec<u8>> {
        let mut data = Vec::with_capacity(length);
        for index in 0..length {
            data.push(wire.read_byte(index + 1 < length)?);
        }
        Ok(data)
    }

    /// Runs one framed transfer: idle check, START, `body`, STOP.
    ///
    /// Whatever happens, the bus is left idle: a NACK gets a plain STOP,
    /// anything else a full reset followed by the configured quiet time.
    fn transfer<T, F>(&mut self, address: u8, body: F) -> Result<T>
    where
        F: FnOnce(&mut Wire<'_>) -> Step<T>,
    {
        if !self.open {
            return Err(Error::Closed("I2C"));
        }
        self.wait_quiet();
        let inner = self.inner.clone();
        let timeouts = &inner.config.i2c;
        let mut wire = Wire {
            lines: inner.lines.as_ref(),
            clock: &inner.clock,
            scl: self.scl.pin(),
            sda: self.sda.pin(),
            timing: self.timing,
            byte_timeout: timeouts.byte_timeout,
            deadline: Instant::now() + timeouts.byte_timeout,
        };
        let outcome = wire
            .ensure_idle(timeouts.recovery_clocks)
            .and_then(|_| wire.start())
            .and_then(|_| body(&mut wire))
            .and_then(|value| wire.stop().map(|_| value));
        let fault = match outcome {
            Ok(value) => return Ok(value),
            Err(fault) => fault,
        };
        let error = match fault {
            Fault::Nack(stage) => {
                debug!(
                    "I2C bus {}: 0x{:02X} did not acknowledge {}",
                    self.bus, address, stage
                );
                if let Err(stop_fault) = wire.stop() {
                    warn!("I2C bus {}: STOP after NACK failed: {:?}", self.bus, stop_fault);
                    self.reset(&mut wire);
                }
                return Err(Error::NoAck {
                    bus: self.bus,
                    address,
                    stage,
                });
            }
            Fault::Timeout => Error::Timeout {
                bus: self.bus,
                address,
            },
            Fault::Bus(reason) => Error::BusFault {
                bus: self.bus,
                address,
                reason,
            },
            Fault::Line(e) => e,
        };
        warn!("I2C bus {} transfer failed: {}", self.bus, error);
        self.reset(&mut wire);
        Err(error)
    }

    /// Forces the bus idle and blocks for the configured quiet time.
    fn reset(&self, wire: &mut Wire<'_>) {
        let timeouts = &self.inner.config.i2c;
        wire.reset(timeouts.recovery_clocks);
        let clock = &self.inner.clock;
        let quiet_until = clock.micros_at(Instant::now() + timeouts.reset_idle);
        self.inner.buses[self.bus as usize]
            .quiet_until_us
            .store(quiet_until, Ordering::Release);
        debug!("I2C bus {} reset, idle for {:?}", self.bus, timeouts.reset_idle);
        self.wait_quiet();
    }

    fn wait_quiet(&self) {
        let quiet_until = self.inner.buses[self.bus as usize]
            .quiet_until_us
            .load(Ordering::Acquire);
        let clock = &self.inner.clock;
        let remaining = clock
            .instant_at(quiet_until)
            .saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            clock.sleep(remaining);
        }
    }
}

impl Drop for I2cBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_timing_fast_mode_respects_minimums() {
        let timing = BusTiming::from_speed_hz(400_000).unwrap();
        assert_eq!(timing.low, Duration::from_nanos(1300));
        assert_eq!(timing.high, Duration::from_nanos(1250));
        assert!(timing.effective_hz() <= 400_000);
        assert!(timing.effective_hz() > 380_000);
    }

    #[test]
    fn test_timing_standard_mode() {
        let timing = BusTiming::from_speed_hz(100_000).unwrap();
        assert_eq!(timing.low, Duration::from_nanos(5000));
        assert_eq!(timing.high, Duration::from_nanos(5000));
        assert_eq!(timing.effective_hz(), 100_000);
    }

    #[test]
    fn test_timing_slow_bus_is_exact() {
        let timing = BusTiming::from_speed_hz(10_000).unwrap();
        assert_eq!(timing.period(), Duration::from_micros(100));
    }

    #[test]
    fn test_timing_rejects_out_of_range() {
        assert_eq!(
            BusTiming::from_speed_hz(0).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
        assert!(BusTiming::from_speed_hz(1_000_000).is_ok());
        assert!(BusTiming::from_speed_hz(1_000_001).is_err());
    }

    #[test]
    fn test_address_validation() {
        assert!(check_address(0x00).is_ok());
        assert!(check_address(0x7F).is_ok());
        assert_eq!(
            check_address(0x80).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
    }

    #[test]
    fn test_length_validation() {
        assert!(check_length(MAX_TRANSFER_LEN).is_ok());
        assert!(check_length(MAX_TRANSFER_LEN + 1).is_err());
        assert!(I2cBus::check_read_length(0).is_err());
        assert!(I2cBus::check_read_length(2).is_ok());
    }
}
