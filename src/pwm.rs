//! PWM channel driver.

use crate::error::{invalid_duty, invalid_frequency, Error, ErrorKind, Result};
use crate::gpio::GpioLevel;
use crate::line::LineConfig;
use crate::registry::{ClaimToken, Owner, PinMode};
use crate::runtime::{Inner, Runtime};
use crate::timer::PwmSettings;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// An open PWM channel generating a waveform on its pin.
///
/// Generation starts on open. Duty and frequency changes take effect at the
/// next period boundary. Dropping the handle closes it.
#[derive(Debug)]
pub struct PwmOutput {
    inner: Arc<Inner>,
    channel: u8,
    pin: ClaimToken,
    settings: PwmSettings,
    running: bool,
    /// Set once the timer reported that generation died on a line error.
    faulted: bool,
}

impl Runtime {
    // --- PWM Methods ---
    /// Claims `pin` for `channel` and starts generating immediately.
    ///
    /// Parameters are validated before anything is claimed. If the timer
    /// cannot start, the pin claim is rolled back.
    pub fn pwm_open(&self, channel: u8, pin: u8, freq_hz: f64, duty: f64) -> Result<PwmOutput> {
        let inner = &self.inner;
        check_frequency(inner, freq_hz)?;
        check_duty(duty)?;
        if channel >= inner.config.pwm_channel_count {
            return Err(Error::InvalidParameter(format!(
                "PWM channel {} out of range (0-{})",
                channel,
                inner.config.pwm_channel_count.saturating_sub(1)
            )));
        }
        if !inner.try_start_channel(channel) {
            return Err(Error::ChannelBusy { channel });
        }

        let lines = &inner.lines;
        let token = match inner.registry.claim_with(
            pin,
            PinMode::Pwm,
            Owner::Pwm { channel },
            || {
                lines.write(pin, GpioLevel::Low)?;
                lines.configure(pin, LineConfig::PushPull)
            },
        ) {
            Ok(token) => token,
            Err(e) => {
                inner.stop_channel(channel);
                return Err(e);
            }
        };

        let settings = PwmSettings { freq_hz, duty };
        if let Err(e) = inner.timer.start(channel, pin, settings) {
            warn!("PWM channel {} failed to start on pin {}: {}", channel, pin, e);
            inner.registry.release_with(&token, || {
                lines.configure(pin, LineConfig::Disabled)
            });
            inner.stop_channel(channel);
            return Err(e);
        }
        debug!(
            "PWM channel {} open on pin {}: {} Hz, duty {}",
            channel, pin, freq_hz, duty
        );
        Ok(PwmOutput {
            inner: inner.clone(),
            channel,
            pin: token,
            settings,
            running: true,
            faulted: false,
        })
    }
}

fn check_duty(duty: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&duty) {
        return Err(invalid_duty(duty));
    }
    Ok(())
}

fn check_frequency(inner: &Inner, freq_hz: f64) -> Result<()> {
    let limits = &inner.config.pwm;
    // Also rejects NaN
    let in_range = freq_hz > 0.0 && freq_hz >= limits.min_freq_hz && freq_hz <= limits.max_freq_hz;
    // The period must also fit a Duration, even under permissive limits
    if !in_range || Duration::try_from_secs_f64(1.0 / freq_hz).is_err() {
        return Err(invalid_frequency(
            freq_hz,
            limits.min_freq_hz,
            limits.max_freq_hz,
        ));
    }
    Ok(())
}

impl PwmOutput {
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn pin(&self) -> u8 {
        self.pin.pin()
    }

    /// Current duty, 0.0-1.0.
    pub fn duty(&self) -> f64 {
        self.settings.duty
    }

    /// Current frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.settings.freq_hz
    }

    /// `false` after `close`, or once a settings change found the
    /// generator stopped by a line error. A faulted channel still holds its
    /// pin until closed.
    pub fn is_running(&self) -> bool {
        self.running && !self.faulted
    }

    /// Changes the duty. The period in progress completes at the old duty.
    pub fn set_duty(&mut self, duty: f64) -> Result<()> {
        if !self.running {
            return Err(Error::Closed("PWM"));
        }
        check_duty(duty)?;
        self.apply(PwmSettings {
            duty,
            ..self.settings
        })
    }

    /// Changes the frequency, keeping the duty. Takes effect at the next
    /// period boundary like a duty change.
    pub fn set_frequency(&mut self, freq_hz: f64) -> Result<()> {
        if !self.running {
            return Err(Error::Closed("PWM"));
        }
        check_frequency(&self.inner, freq_hz)?;
        self.apply(PwmSettings {
            freq_hz,
            ..self.settings
        })
    }

    fn apply(&mut self, settings: PwmSettings) -> Result<()> {
        if let Err(e) = self.inner.timer.update(self.channel, settings) {
            if e.kind() == ErrorKind::HardwareFault {
                warn!("PWM channel {} is no longer generating: {}", self.channel, e);
                self.faulted = true;
            }
            return Err(e);
        }
        self.settings = settings;
        trace!(
            "PWM channel {}: {} Hz, duty {}",
            self.channel,
            settings.freq_hz,
            settings.duty
        );
        Ok(())
    }

    /// Stops generation, leaves the pin driven low and releases it.
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let inner = &self.inner;
        if let Err(e) = inner.timer.stop(self.channel) {
            warn!("PWM channel {} stop failed: {}", self.channel, e);
        }
        let pin = self.pin.pin();
        let lines = &inner.lines;
        inner
            .registry
            .release_with(&self.pin, || lines.write(pin, GpioLevel::Low));
        inner.stop_channel(self.channel);
        debug!("PWM channel {} closed, pin {} low", self.channel, pin);
    }
}

impl Drop for PwmOutput {
    fn drop(&mut self) {
        self.close();
    }
}
