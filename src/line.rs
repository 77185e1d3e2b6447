//! Line backend abstraction.
//!
//! Every driver in the runtime reaches hardware through a [`LineDriver`].
//! A backend only knows how to configure a physical line and drive or sample
//! its level; ownership, protocol framing and waveform timing live above it.

use crate::error::Result;
use crate::gpio::{GpioLevel, GpioPull};
use std::fmt;

/// Electrical configuration of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineConfig {
    /// High impedance, not driven by this controller.
    Disabled,
    /// Input with the given internal pull resistor.
    Input(GpioPull),
    /// Actively driven high and low.
    PushPull,
    /// Driven low or released; the external pull-up provides the high level.
    OpenDrain,
}

impl fmt::Display for LineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineConfig::Disabled => write!(f, "disabled"),
            LineConfig::Input(GpioPull::None) => write!(f, "input"),
            LineConfig::Input(GpioPull::Up) => write!(f, "input (pull-up)"),
            LineConfig::Input(GpioPull::Down) => write!(f, "input (pull-down)"),
            LineConfig::PushPull => write!(f, "push-pull output"),
            LineConfig::OpenDrain => write!(f, "open-drain output"),
        }
    }
}

/// Hardware access to the physical lines of a target.
///
/// Implementations must be callable from several threads at once; the
/// runtime serializes access per line, not per backend.
pub trait LineDriver: Send + Sync {
    /// Number of physical lines, indexed `0..line_count()`.
    fn line_count(&self) -> u8;

    /// Applies an electrical configuration to a line.
    fn configure(&self, line: u8, config: LineConfig) -> Result<()>;

    /// Drives a line. On open-drain lines `High` releases the line.
    fn write(&self, line: u8, level: GpioLevel) -> Result<()>;

    /// Samples the level actually present on the line.
    fn read(&self, line: u8) -> Result<GpioLevel>;
}
