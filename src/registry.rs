//! Pin registry and resource arbiter.
//!
//! The registry is the single authority over pin ownership. Each pin record
//! sits behind its own mutex, so claiming pin 4 never waits on pin 5, and
//! every check-and-set on a pin is one indivisible critical section.
//!
//! Hardware side effects that must happen together with a state change
//! (configuring a line when it is claimed, driving it while checking its
//! mode) are passed in as closures and run while the pin lock is held.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::gpio::{GpioLevel, GpioPull};
use log::{debug, trace, warn};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Current use of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Unclaimed,
    Input(GpioPull),
    Output,
    /// SCL or SDA line of an open I2C bus.
    I2c,
    /// Output of a running PWM channel.
    Pwm,
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::Unclaimed => write!(f, "unclaimed"),
            PinMode::Input(GpioPull::None) => write!(f, "input"),
            PinMode::Input(GpioPull::Up) => write!(f, "input (pull-up)"),
            PinMode::Input(GpioPull::Down) => write!(f, "input (pull-down)"),
            PinMode::Output => write!(f, "output"),
            PinMode::I2c => write!(f, "claimed by I2C"),
            PinMode::Pwm => write!(f, "claimed by PWM"),
        }
    }
}

/// The consumer holding a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Gpio,
    I2c { bus: u8 },
    Pwm { channel: u8 },
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Gpio => write!(f, "GPIO driver"),
            Owner::I2c { bus } => write!(f, "I2C bus {}", bus),
            Owner::Pwm { channel } => write!(f, "PWM channel {}", channel),
        }
    }
}

/// Proof of a claim on one pin.
///
/// Tokens are tied to the claim that produced them: once released, the same
/// token can never release a later claim on that pin, even by another owner.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a claim token leaves the pin claimed"]
pub struct ClaimToken {
    pin: u8,
    owner: Owner,
    generation: u64,
}

impl ClaimToken {
    /// The claimed pin.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// The consumer the claim was made for.
    pub fn owner(&self) -> Owner {
        self.owner
    }
}

/// Point-in-time view of a pin, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinInfo {
    pub pin: u8,
    pub mode: PinMode,
    pub owner: Option<Owner>,
    /// Last level driven (outputs) or sampled (inputs).
    pub level: GpioLevel,
    /// Milliseconds the current claim has been held, `None` when unclaimed.
    pub held_for_ms: Option<u64>,
}

#[derive(Debug)]
struct PinRecord {
    mode: PinMode,
    owner: Option<Owner>,
    level: GpioLevel,
    generation: u64,
    claimed_at_ms: u64,
}

impl PinRecord {
    fn unclaimed() -> Self {
        PinRecord {
            mode: PinMode::Unclaimed,
            owner: None,
            level: GpioLevel::Low,
            generation: 0,
            claimed_at_ms: 0,
        }
    }

    fn busy(&self, pin: u8) -> Error {
        Error::Busy {
            pin,
            mode: self.mode,
            // A claimed record always has an owner
            owner: self.owner.unwrap_or(Owner::Gpio),
        }
    }

    fn reset(&mut self) {
        self.mode = PinMode::Unclaimed;
        self.owner = None;
    }
}

/// Process-lifetime table of every physical line on the target.
#[derive(Debug)]
pub struct Registry {
    pins: Vec<Mutex<PinRecord>>,
    clock: Clock,
}

impl Registry {
    /// Creates a registry with `line_count` unclaimed pins.
    pub fn new(line_count: u8, clock: Clock) -> Self {
        Registry {
            pins: (0..line_count)
                .map(|_| Mutex::new(PinRecord::unclaimed()))
                .collect(),
            clock,
        }
    }

    /// Number of pins tracked.
    pub fn line_count(&self) -> u8 {
        self.pins.len() as u8
    }

    fn lock(&self, pin: u8) -> Result<MutexGuard<'_, PinRecord>> {
        let record = self.pins.get(pin as usize).ok_or(Error::InvalidPin {
            pin,
            line_count: self.line_count(),
        })?;
        // A panic inside a hardware closure leaves the record consistent:
        // fields are only written after the closure returns.
        Ok(record.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Claims an unclaimed pin. Fails with `Busy` if anyone holds it.
    pub fn claim(&self, pin: u8, mode: PinMode, owner: Owner) -> Result<ClaimToken> {
        self.claim_with(pin, mode, owner, || Ok(()))
    }

    /// Claims an unclaimed pin, running `configure` under the pin lock.
    ///
    /// If `configure` fails the pin stays unclaimed and the error is returned.
    pub fn claim_with<F>(
        &self,
        pin: u8,
        mode: PinMode,
        owner: Owner,
        configure: F,
    ) -> Result<ClaimToken>
    where
        F: FnOnce() -> Result<()>,
    {
        if mode == PinMode::Unclaimed {
            return Err(Error::InvalidParameter(
                "cannot claim a pin as unclaimed".to_string(),
            ));
        }
        let mut record = self.lock(pin)?;
        if record.mode != PinMode::Unclaimed {
            trace!("Claim of pin {} by {} refused: {}", pin, owner, record.mode);
            return Err(record.busy(pin));
        }
        configure()?;
        record.mode = mode;
        record.owner = Some(owner);
        record.generation += 1;
        record.claimed_at_ms = self.clock.now_ms();
        debug!("Pin {} claimed by {} as {}", pin, owner, mode);
        Ok(ClaimToken {
            pin,
            owner,
            generation: record.generation,
        })
    }

    /// Claims a pin, or changes its mode if `owner` already holds it.
    ///
    /// `apply` receives the previous mode and performs the hardware change;
    /// it may return a new cached level for the pin.
    pub fn claim_or_switch<F>(&self, pin: u8, mode: PinMode, owner: Owner, apply: F) -> Result<()>
    where
        F: FnOnce(PinMode) -> Result<Option<GpioLevel>>,
    {
        if mode == PinMode::Unclaimed {
            return Err(Error::InvalidParameter(
                "cannot claim a pin as unclaimed".to_string(),
            ));
        }
        let mut record = self.lock(pin)?;
        let fresh = match record.owner {
            None => true,
            Some(holder) if holder == owner => false,
            Some(_) => return Err(record.busy(pin)),
        };
        if let Some(level) = apply(record.mode)? {
            record.level = level;
        }
        if fresh {
            record.owner = Some(owner);
            record.generation += 1;
            record.claimed_at_ms = self.clock.now_ms();
        }
        record.mode = mode;
        Ok(())
    }

    /// Releases the claim behind `token`. Returns `true` if a claim was released.
    ///
    /// Releasing twice, or releasing after the pin has moved on to a newer
    /// claim, is a no-op.
    pub fn release(&self, token: &ClaimToken) -> bool {
        self.release_with(token, || Ok(()))
    }

    /// Releases the claim behind `token`, running `deconfigure` first.
    ///
    /// The claim is released even if `deconfigure` fails; the failure is
    /// logged since the caller is usually tearing down.
    pub fn release_with<F>(&self, token: &ClaimToken, deconfigure: F) -> bool
    where
        F: FnOnce() -> Result<()>,
    {
        let Ok(mut record) = self.lock(token.pin) else {
            return false;
        };
        if record.generation != token.generation || record.owner != Some(token.owner) {
            trace!("Stale release of pin {} by {} ignored", token.pin, token.owner);
            return false;
        }
        if let Err(e) = deconfigure() {
            warn!("Deconfiguring pin {} on release failed: {}", token.pin, e);
        }
        record.reset();
        debug!("Pin {} released by {}", token.pin, token.owner);
        true
    }

    /// Releases `pin` if `owner` holds it. Returns whether a claim was released.
    pub fn release_owned<F>(&self, pin: u8, owner: Owner, deconfigure: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut record = self.lock(pin)?;
        if record.owner != Some(owner) {
            return Ok(false);
        }
        if let Err(e) = deconfigure() {
            warn!("Deconfiguring pin {} on release failed: {}", pin, e);
        }
        record.reset();
        debug!("Pin {} released by {}", pin, owner);
        Ok(true)
    }

    /// Drives an `Output` pin through `drive` and caches the level.
    pub fn set_level<F>(&self, pin: u8, level: GpioLevel, drive: F) -> Result<()>
    where
        F: FnOnce(GpioLevel) -> Result<()>,
    {
        let mut record = self.lock(pin)?;
        if record.mode != PinMode::Output {
            return Err(Error::InvalidMode {
                pin,
                mode: record.mode,
                required: "output",
            });
        }
        drive(level)?;
        record.level = level;
        Ok(())
    }

    /// Samples an `Input` pin through `sample` and caches the level.
    pub fn read_level<F>(&self, pin: u8, sample: F) -> Result<GpioLevel>
    where
        F: FnOnce() -> Result<GpioLevel>,
    {
        let mut record = self.lock(pin)?;
        if !matches!(record.mode, PinMode::Input(_)) {
            return Err(Error::InvalidMode {
                pin,
                mode: record.mode,
                required: "input",
            });
        }
        let level = sample()?;
        record.level = level;
        Ok(level)
    }

    /// Cached level of an `Output` pin.
    pub fn output_level(&self, pin: u8) -> Result<GpioLevel> {
        let record = self.lock(pin)?;
        if record.mode != PinMode::Output {
            return Err(Error::InvalidMode {
                pin,
                mode: record.mode,
                required: "output",
            });
        }
        Ok(record.level)
    }

    /// Current mode of a pin.
    pub fn mode(&self, pin: u8) -> Result<PinMode> {
        Ok(self.lock(pin)?.mode)
    }

    /// Diagnostic snapshot of a pin.
    pub fn snapshot(&self, pin: u8) -> Result<PinInfo> {
        let record = self.lock(pin)?;
        let held_for_ms = record
            .owner
            .map(|_| self.clock.now_ms().saturating_sub(record.claimed_at_ms));
        Ok(PinInfo {
            pin,
            mode: record.mode,
            owner: record.owner,
            level: record.level,
            held_for_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn registry() -> Registry {
        Registry::new(8, Clock::new())
    }

    #[test]
    fn test_claim_release_claim_other_mode() {
        let reg = registry();
        for pin in 0..reg.line_count() {
            let token = reg.claim(pin, PinMode::Output, Owner::Gpio).unwrap();
            assert!(reg.release(&token));
            let token = reg
                .claim(pin, PinMode::I2c, Owner::I2c { bus: 0 })
                .unwrap();
            assert_eq!(reg.mode(pin).unwrap(), PinMode::I2c);
            assert!(reg.release(&token));
            assert_eq!(reg.mode(pin).unwrap(), PinMode::Unclaimed);
        }
    }

    #[test]
    fn test_second_claim_is_busy() {
        let reg = registry();
        let _token = reg.claim(3, PinMode::Pwm, Owner::Pwm { channel: 0 }).unwrap();
        let err = reg.claim(3, PinMode::Output, Owner::Gpio).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        match err {
            Error::Busy { pin, mode, owner } => {
                assert_eq!(pin, 3);
                assert_eq!(mode, PinMode::Pwm);
                assert_eq!(owner, Owner::Pwm { channel: 0 });
            }
            e => panic!("expected Busy, got {:?}", e),
        }
    }

    #[test]
    fn test_stale_token_cannot_release_new_claim() {
        let reg = registry();
        let old = reg.claim(1, PinMode::Output, Owner::Gpio).unwrap();
        assert!(reg.release(&old));
        assert!(!reg.release(&old));
        let _new = reg.claim(1, PinMode::Pwm, Owner::Pwm { channel: 2 }).unwrap();
        assert!(!reg.release(&old));
        assert_eq!(reg.mode(1).unwrap(), PinMode::Pwm);
    }

    #[test]
    fn test_failed_configure_leaves_pin_unclaimed() {
        let reg = registry();
        let err = reg
            .claim_with(2, PinMode::Output, Owner::Gpio, || {
                Err(Error::HardwareFault("boom".into()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert_eq!(reg.mode(2).unwrap(), PinMode::Unclaimed);
    }

    #[test]
    fn test_level_requires_matching_mode() {
        let reg = registry();
        reg.claim_or_switch(0, PinMode::Input(GpioPull::Up), Owner::Gpio, |_| Ok(None))
            .unwrap();
        let err = reg.set_level(0, GpioLevel::High, |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
        assert_eq!(
            reg.read_level(0, || Ok(GpioLevel::High)).unwrap(),
            GpioLevel::High
        );

        reg.claim_or_switch(0, PinMode::Output, Owner::Gpio, |_| {
            Ok(Some(GpioLevel::Low))
        })
        .unwrap();
        let err = reg.read_level(0, || Ok(GpioLevel::Low)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
        reg.set_level(0, GpioLevel::High, |_| Ok(())).unwrap();
        assert_eq!(reg.output_level(0).unwrap(), GpioLevel::High);
    }

    #[test]
    fn test_switch_refused_for_other_owner() {
        let reg = registry();
        let _bus = reg.claim(5, PinMode::I2c, Owner::I2c { bus: 1 }).unwrap();
        let err = reg
            .claim_or_switch(5, PinMode::Output, Owner::Gpio, |_| Ok(None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_invalid_pin() {
        let reg = registry();
        let err = reg.claim(8, PinMode::Output, Owner::Gpio).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPin);
        assert!(reg.snapshot(200).is_err());
    }

    #[test]
    fn test_snapshot_reports_owner() {
        let reg = registry();
        let token = reg.claim(6, PinMode::Pwm, Owner::Pwm { channel: 3 }).unwrap();
        let info = reg.snapshot(6).unwrap();
        assert_eq!(info.owner, Some(Owner::Pwm { channel: 3 }));
        assert!(info.held_for_ms.is_some());
        reg.release(&token);
        let info = reg.snapshot(6).unwrap();
        assert_eq!(info.mode, PinMode::Unclaimed);
        assert_eq!(info.held_for_ms, None);
    }
}
