//! # periphio
//!
//! A peripheral I/O runtime for scripted controllers: it arbitrates access
//! to the physical lines of a target between GPIO, I²C and PWM users,
//! bit-bangs I²C, generates PWM waveforms and provides monotonic timing.
//!
//! ## Features
//!
//! *   Pin registry (`Registry`): one record per physical line, exclusive
//!     ownership through claim tokens, per-pin locking.
//! *   GPIO (`gpio_set_mode`, `gpio_write`, `gpio_read`, `gpio_release`):
//!     inputs with optional pull resistors, push-pull outputs.
//! *   I²C master (`i2c_open`, `I2cBus`):
//!     *   7-bit addressing, 1 Hz to 1 MHz with per-mode minimum SCL timing.
//!     *   `write`, `read`, `write_read` (repeated START) and `scan`.
//!     *   Clock stretching bounded by a per-byte timeout.
//!     *   Bus recovery (SCL pulses + STOP) and a quiet period after faults.
//! *   PWM (`pwm_open`, `PwmOutput`): duty and frequency changes applied at
//!     period boundaries, constant levels at duty 0.0 and 1.0.
//! *   Clock (`Clock`): millisecond and microsecond time since start,
//!     scheduler-friendly sleeps and fine-grained delays.
//! *   Script bindings (`script::Bindings`): the flat, boolean-returning
//!     function table used by control scripts.
//! *   Backends (`LineDriver`, `PwmTimer`):
//!     *   `sim::SimBoard`, an in-memory board with simulated I²C targets.
//!     *   `hid::Xr2280xEdge` (feature `xr2280x`), the EDGE interface of
//!         MaxLinear/Exar XR2280x USB bridges via `hidapi`.
//!
//! ## Basic Usage
//!
//! ```
//! use periphio::sim::{RegisterDevice, SimBoard};
//! use periphio::{GpioLevel, GpioMode, Result, Runtime};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let board = Arc::new(SimBoard::new(32));
//!     board.attach_i2c(22, 21, Box::new(RegisterDevice::with_registers(0x48, &[(0x00, 0x19)])));
//!     let runtime = Runtime::new(board.clone());
//!
//!     // --- GPIO ---
//!     runtime.gpio_set_mode(2, GpioMode::Output)?;
//!     runtime.gpio_write(2, GpioLevel::High)?;
//!
//!     // --- I2C ---
//!     let mut bus = runtime.i2c_open(0, 22, 21, 400_000)?;
//!     let temperature = bus.write_read(0x48, &[0x00], 1)?;
//!     assert_eq!(temperature, vec![0x19]);
//!     bus.close();
//!
//!     // --- PWM ---
//!     let mut led = runtime.pwm_open(0, 5, 1000.0, 0.25)?;
//!     led.set_duty(0.75)?;
//!     led.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Ownership
//!
//! A pin is always exactly one of unclaimed, GPIO input, GPIO output, I²C
//! or PWM. `I2cBus` and `PwmOutput` hold claim tokens for their pins and
//! release them on `close` or drop; a claim made by one consumer cannot be
//! released through another consumer's stale token.
//!
//! ## Errors
//!
//! Every fallible call returns [`Result`]. [`Error::kind`] classifies an
//! error into the [`ErrorKind`] taxonomy; `Busy`, `NoAck` and `Timeout` are
//! worth retrying (`ErrorKind::is_recoverable`). The script bindings log
//! the kind and collapse it to `false`.

mod clock;
mod config;
mod consts;
mod error;
pub mod gpio;
#[cfg(feature = "xr2280x")]
pub mod hid;
pub mod i2c;
mod line;
pub mod pwm;
mod registry;
mod runtime;
pub mod script;
pub mod sim;
pub mod timer;

pub use clock::Clock;
pub use config::{I2cTimeouts, PwmLimits, RuntimeConfig};
pub use error::{AckStage, BusFaultReason, Error, ErrorKind, Result};
pub use gpio::{GpioLevel, GpioMode, GpioPull};
pub use i2c::{BusTiming, I2cBus};
pub use line::{LineConfig, LineDriver};
pub use pwm::PwmOutput;
pub use registry::{ClaimToken, Owner, PinInfo, PinMode, Registry};
pub use runtime::Runtime;
pub use timer::{PwmSettings, PwmTimer, SoftPwm};
