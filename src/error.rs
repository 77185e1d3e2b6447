use crate::registry::{Owner, PinMode};
use std::fmt;
use thiserror::Error;

/// Coarse classification of an [`Error`].
///
/// Every error the runtime produces falls into exactly one of these kinds.
/// The script bindings collapse all of them to `false`, but embedders can
/// branch on the kind to decide whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resource already claimed by another consumer.
    Busy,
    /// Pin index does not exist on the target.
    InvalidPin,
    /// Operation not valid for the current pin or handle mode.
    InvalidMode,
    /// Out-of-range frequency, duty, length, address or index.
    InvalidParameter,
    /// I2C device did not acknowledge.
    NoAck,
    /// Bounded wait exceeded.
    Timeout,
    /// Electrical or arbitration-loss condition on a bus.
    BusFault,
    /// Unrecoverable driver-level condition reported by the line backend.
    HardwareFault,
    /// Operation on an already-closed handle.
    Closed,
}

impl ErrorKind {
    /// Returns `true` for kinds where retrying the same operation later is a
    /// valid caller strategy.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Busy | ErrorKind::NoAck | ErrorKind::Timeout)
    }
}

/// The point of an I2C transfer at which the target stopped acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStage {
    /// The address byte was not acknowledged (no device at that address).
    Address,
    /// The data byte at this offset was not acknowledged.
    Data(usize),
}

impl fmt::Display for AckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStage::Address => write!(f, "address byte"),
            AckStage::Data(index) => write!(f, "data byte {}", index),
        }
    }
}

/// What went wrong electrically when a bus fault is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFaultReason {
    /// SDA read back low while this master was releasing it.
    ArbitrationLost,
    /// SDA stayed low after clocking out the recovery sequence.
    SdaStuckLow,
}

impl fmt::Display for BusFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusFaultReason::ArbitrationLost => write!(f, "arbitration lost"),
            BusFaultReason::SdaStuckLow => write!(f, "SDA held low"),
        }
    }
}

/// Errors that can occur when using the peripheral runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// The pin is already claimed by another consumer.
    #[error("Pin {pin} is busy: currently {mode}, owned by {owner}")]
    Busy {
        /// The pin that was requested.
        pin: u8,
        /// The mode the pin is currently claimed in.
        mode: PinMode,
        /// The consumer currently holding the pin.
        owner: Owner,
    },
    /// An I2C bus with this index is already open.
    #[error("I2C bus {bus} is already open")]
    BusBusy {
        /// The bus index that was requested.
        bus: u8,
    },
    /// A PWM channel with this index is already running.
    #[error("PWM channel {channel} is already running")]
    ChannelBusy {
        /// The channel index that was requested.
        channel: u8,
    },
    /// The pin index is not backed by a physical line.
    #[error("Pin {pin} does not exist on this target ({line_count} lines available)")]
    InvalidPin {
        /// The invalid pin index.
        pin: u8,
        /// Number of lines the backend provides.
        line_count: u8,
    },
    /// The pin is not in the mode the operation requires.
    #[error("Pin {pin} is {mode}, operation requires {required}")]
    InvalidMode {
        /// The pin the operation targeted.
        pin: u8,
        /// The pin's current mode.
        mode: PinMode,
        /// Human readable description of the required mode.
        required: &'static str,
    },
    /// Function argument is outside the valid range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// The I2C target did not acknowledge.
    #[error("No acknowledge from I2C address 0x{address:02X} on bus {bus} ({stage})")]
    NoAck {
        /// Bus the transfer ran on.
        bus: u8,
        /// 7-bit target address.
        address: u8,
        /// Where in the transfer the NACK was observed.
        stage: AckStage,
    },
    /// A bounded wait was exceeded, usually SCL held low by a stuck target.
    #[error(
        "I2C timeout on bus {bus} at address 0x{address:02X}: SCL held low past the per-byte limit. Check target power and wiring."
    )]
    Timeout {
        /// Bus the transfer ran on.
        bus: u8,
        /// 7-bit target address.
        address: u8,
    },
    /// Electrical or arbitration problem on the bus; the bus was reset.
    #[error("I2C bus fault on bus {bus} at address 0x{address:02X}: {reason}")]
    BusFault {
        /// Bus the transfer ran on.
        bus: u8,
        /// 7-bit target address.
        address: u8,
        /// What was observed on the wires.
        reason: BusFaultReason,
    },
    /// The line backend reported an unrecoverable condition.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),
    /// Error from the underlying HID API layer of the USB bridge backend.
    #[cfg(feature = "xr2280x")]
    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),
    /// The handle was already closed.
    #[error("{0} handle is closed")]
    Closed(&'static str),
}

impl Error {
    /// Classifies this error into the runtime's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Busy { .. } | Error::BusBusy { .. } | Error::ChannelBusy { .. } => {
                ErrorKind::Busy
            }
            Error::InvalidPin { .. } => ErrorKind::InvalidPin,
            Error::InvalidMode { .. } => ErrorKind::InvalidMode,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::NoAck { .. } => ErrorKind::NoAck,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::BusFault { .. } => ErrorKind::BusFault,
            Error::HardwareFault(_) => ErrorKind::HardwareFault,
            #[cfg(feature = "xr2280x")]
            Error::Hid(_) => ErrorKind::HardwareFault,
            Error::Closed(_) => ErrorKind::Closed,
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

// Helpers for the parameter checks shared by several drivers
pub(crate) fn invalid_duty(duty: f64) -> Error {
    Error::InvalidParameter(format!("duty {} outside 0.0-1.0", duty))
}

pub(crate) fn invalid_frequency(freq_hz: f64, min: f64, max: f64) -> Error {
    Error::InvalidParameter(format!(
        "frequency {} Hz outside {}-{} Hz",
        freq_hz, min, max
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::Busy.is_recoverable());
        assert!(ErrorKind::NoAck.is_recoverable());
        assert!(ErrorKind::Timeout.is_recoverable());
        assert!(!ErrorKind::BusFault.is_recoverable());
        assert!(!ErrorKind::HardwareFault.is_recoverable());
        assert!(!ErrorKind::InvalidParameter.is_recoverable());
    }

    #[test]
    fn test_busy_variants_share_kind() {
        let pin = Error::Busy {
            pin: 4,
            mode: PinMode::Output,
            owner: Owner::Gpio,
        };
        assert_eq!(pin.kind(), ErrorKind::Busy);
        assert_eq!(Error::BusBusy { bus: 0 }.kind(), ErrorKind::Busy);
        assert_eq!(Error::ChannelBusy { channel: 1 }.kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_nack_message_names_stage() {
        let err = Error::NoAck {
            bus: 0,
            address: 0x48,
            stage: AckStage::Data(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x48"));
        assert!(msg.contains("data byte 2"));
    }
}
