//! Simulated board for tests and host-side development.
//!
//! [`SimBoard`] implements [`LineDriver`] entirely in memory. Lines can be
//! wired into an I2C bus with simulated targets attached; the wires behave
//! as open-drain with pull-ups (wired-AND), so targets ACK, send data and
//! can be made to hold either line low. Every level change on a plain line is
//! recorded with a timestamp for waveform checks.

use crate::error::{Error, Result};
use crate::gpio::{GpioLevel, GpioPull};
use crate::line::{LineConfig, LineDriver};
use log::trace;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Most recent level changes kept across all lines; older ones are dropped.
pub const TRANSITION_LIMIT: usize = 16_384;

/// A simulated I2C target device.
pub trait I2cTarget: Send {
    /// 7-bit address the target responds to.
    fn address(&self) -> u8;

    /// Called after the target acknowledged its address.
    fn start(&mut self, _read: bool) {}

    /// Receives a byte written by the master. Returns `true` to ACK.
    fn write(&mut self, byte: u8) -> bool;

    /// Supplies the next byte for the master to read.
    fn read(&mut self) -> u8;

    /// Called on STOP while the target was selected.
    fn stop(&mut self) {}
}

/// Register file shared between a [`RegisterDevice`] and the test driving it.
pub type SharedRegisters = Arc<Mutex<Vec<u8>>>;

/// A target with 256 byte-wide registers behind an auto-incrementing
/// pointer, the layout used by most I2C sensors.
///
/// The first byte of every write transfer sets the pointer; further bytes
/// are stored from there. Reads return registers from the pointer onwards.
#[derive(Debug)]
pub struct RegisterDevice {
    address: u8,
    pointer: u8,
    pointer_pending: bool,
    registers: SharedRegisters,
}

impl RegisterDevice {
    pub fn new(address: u8) -> Self {
        RegisterDevice {
            address,
            pointer: 0,
            pointer_pending: false,
            registers: Arc::new(Mutex::new(vec![0; 256])),
        }
    }

    /// Creates a device with some registers preset.
    pub fn with_registers(address: u8, values: &[(u8, u8)]) -> Self {
        let device = Self::new(address);
        {
            let mut registers = lock(&device.registers);
            for &(register, value) in values {
                registers[register as usize] = value;
            }
        }
        device
    }

    /// Handle onto the register file, usable after the device is attached.
    pub fn registers(&self) -> SharedRegisters {
        self.registers.clone()
    }
}

impl I2cTarget for RegisterDevice {
    fn address(&self) -> u8 {
        self.address
    }

    fn start(&mut self, read: bool) {
        self.pointer_pending = !read;
    }

    fn write(&mut self, byte: u8) -> bool {
        if self.pointer_pending {
            self.pointer = byte;
            self.pointer_pending = false;
        } else {
            lock(&self.registers)[self.pointer as usize] = byte;
            self.pointer = self.pointer.wrapping_add(1);
        }
        true
    }

    fn read(&mut self) -> u8 {
        let value = lock(&self.registers)[self.pointer as usize];
        self.pointer = self.pointer.wrapping_add(1);
        value
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub line: u8,
    pub level: GpioLevel,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Address,
    Write,
    Read,
    /// Not addressed, or the master NACKed a read; wait for STOP.
    Ignore,
}

/// Target-side protocol state of one bus.
#[derive(Debug)]
struct Engine {
    phase: Phase,
    /// Rising SCL edges seen in the current 9-clock frame.
    clocks: u8,
    shift: u8,
    out: u8,
    master_nack: bool,
    selected: Option<usize>,
    sda_low: bool,
    /// Bytes sent to the master since the last START.
    bytes_out: usize,
    /// A data byte (not the address ACK) occupies the current read frame.
    byte_on_wire: bool,
}

impl Engine {
    fn new() -> Self {
        Engine {
            phase: Phase::Idle,
            clocks: 0,
            shift: 0,
            out: 0,
            master_nack: false,
            selected: None,
            sda_low: false,
            bytes_out: 0,
            byte_on_wire: false,
        }
    }

    fn start(&mut self) {
        trace!("sim: START");
        self.phase = Phase::Address;
        self.clocks = 0;
        self.shift = 0;
        self.sda_low = false;
        self.selected = None;
        self.bytes_out = 0;
        self.byte_on_wire = false;
    }

    fn stop(&mut self, targets: &mut [Box<dyn I2cTarget>]) {
        trace!("sim: STOP");
        if let Some(index) = self.selected.take() {
            targets[index].stop();
        }
        self.phase = Phase::Idle;
        self.sda_low = false;
    }

    fn scl_rise(&mut self, sda: bool) {
        match self.phase {
            Phase::Address | Phase::Write if self.clocks < 8 => {
                self.shift = self.shift << 1 | sda as u8;
            }
            Phase::Read if self.clocks == 8 => self.master_nack = sda,
            _ => {}
        }
        if self.phase != Phase::Idle {
            self.clocks = self.clocks.saturating_add(1);
        }
    }

    fn scl_fall(&mut self, targets: &mut [Box<dyn I2cTarget>]) {
        match (self.phase, self.clocks) {
            (Phase::Address, 8) => {
                let address = self.shift >> 1;
                let read = self.shift & 1 == 1;
                self.selected = targets.iter().position(|t| t.address() == address);
                match self.selected {
                    Some(index) => {
                        trace!("sim: 0x{:02X} selected ({})", address, if read { "R" } else { "W" });
                        targets[index].start(read);
                        self.sda_low = true;
                        self.phase = if read { Phase::Read } else { Phase::Write };
                    }
                    None => self.phase = Phase::Ignore,
                }
                self.master_nack = false;
            }
            (Phase::Write, 8) => {
                let acked = self.selected.map_or(false, |index| targets[index].write(self.shift));
                self.sda_low = acked;
            }
            (Phase::Read, 8) => self.sda_low = false,
            (Phase::Write | Phase::Read, 9) => {
                self.sda_low = false;
                self.clocks = 0;
                self.shift = 0;
                if self.phase == Phase::Read {
                    if self.byte_on_wire {
                        self.bytes_out += 1;
                    }
                    if self.master_nack {
                        self.phase = Phase::Ignore;
                    } else {
                        self.load_byte(targets);
                    }
                }
            }
            (Phase::Read, bit @ 1..=7) => self.sda_low = self.out >> (7 - bit) & 1 == 0,
            _ => {}
        }
    }

    /// Loads the next byte of a read and drives its first bit.
    fn load_byte(&mut self, targets: &mut [Box<dyn I2cTarget>]) {
        self.out = self.selected.map_or(0xFF, |index| targets[index].read());
        self.byte_on_wire = true;
        self.sda_low = self.out & 0x80 == 0;
    }
}

/// Two lines wired as an I2C bus.
struct SimBus {
    scl: u8,
    sda: u8,
    targets: Vec<Box<dyn I2cTarget>>,
    engine: Engine,
    scl_held: bool,
    sda_held: bool,
    /// Hold SCL low once this many bytes of a read have been sent.
    stall_after: Option<usize>,
    scl_level: bool,
    sda_level: bool,
}

impl SimBus {
    fn new(scl: u8, sda: u8) -> Self {
        SimBus {
            scl,
            sda,
            targets: Vec::new(),
            engine: Engine::new(),
            scl_held: false,
            sda_held: false,
            stall_after: None,
            scl_level: true,
            sda_level: true,
        }
    }

    /// Recomputes the wire levels from the master's outputs and feeds any
    /// edge into the target state machine.
    fn settle(&mut self, master_scl: bool, master_sda: bool) {
        let scl = master_scl && !self.scl_held;
        let sda = master_sda && !self.sda_held && !self.engine.sda_low;
        if scl != self.scl_level {
            self.scl_level = scl;
            if scl {
                self.engine.scl_rise(self.sda_level);
            } else {
                self.engine.scl_fall(&mut self.targets);
                if self
                    .stall_after
                    .is_some_and(|bytes| self.engine.bytes_out >= bytes)
                {
                    trace!("sim: target stalls SCL after {} bytes", self.engine.bytes_out);
                    self.stall_after = None;
                    self.scl_held = true;
                }
            }
        } else if scl && sda != self.sda_level {
            if sda {
                self.engine.stop(&mut self.targets);
            } else {
                self.engine.start();
            }
        }
        self.sda_level = master_sda && !self.sda_held && !self.engine.sda_low;
    }

    fn level(&self, line: u8) -> Option<GpioLevel> {
        if line == self.scl {
            Some(self.scl_level.into())
        } else if line == self.sda {
            Some(self.sda_level.into())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimLine {
    config: LineConfig,
    driven: GpioLevel,
    external: Option<GpioLevel>,
    failed: bool,
}

impl SimLine {
    /// Level the controller itself puts on the line; released lines float
    /// high on a pulled-up wire.
    fn master_high(&self) -> bool {
        match self.config {
            LineConfig::PushPull | LineConfig::OpenDrain => self.driven.is_high(),
            _ => true,
        }
    }

    fn level(&self) -> GpioLevel {
        match self.config {
            LineConfig::PushPull => self.driven,
            LineConfig::OpenDrain if !self.driven.is_high() => GpioLevel::Low,
            LineConfig::OpenDrain => self.external.unwrap_or(GpioLevel::High),
            LineConfig::Input(GpioPull::Up) => self.external.unwrap_or(GpioLevel::High),
            LineConfig::Input(_) | LineConfig::Disabled => self.external.unwrap_or(GpioLevel::Low),
        }
    }
}

struct Board {
    lines: Vec<SimLine>,
    buses: Vec<SimBus>,
    transitions: VecDeque<Transition>,
}

impl Board {
    fn check(&self, line: u8) -> Result<&SimLine> {
        let sim = self.lines.get(line as usize).ok_or(Error::InvalidPin {
            pin: line,
            line_count: self.lines.len() as u8,
        })?;
        if sim.failed {
            return Err(Error::HardwareFault(format!("simulated failure on line {}", line)));
        }
        Ok(sim)
    }

    fn level(&self, line: u8) -> GpioLevel {
        self.buses
            .iter()
            .find_map(|bus| bus.level(line))
            .unwrap_or_else(|| self.lines[line as usize].level())
    }

    /// Applies a change on `line` and records the resulting level change.
    fn settle(&mut self, line: u8, before: GpioLevel) {
        let lines = &self.lines;
        if let Some(bus) = self
            .buses
            .iter_mut()
            .find(|bus| bus.scl == line || bus.sda == line)
        {
            let scl = lines[bus.scl as usize].master_high();
            let sda = lines[bus.sda as usize].master_high();
            bus.settle(scl, sda);
            return;
        }
        let level = self.level(line);
        if level != before {
            if self.transitions.len() == TRANSITION_LIMIT {
                self.transitions.pop_front();
            }
            self.transitions.push_back(Transition {
                line,
                level,
                at: Instant::now(),
            });
        }
    }

    fn bus_mut(&mut self, scl: u8, sda: u8) -> &mut SimBus {
        let index = match self
            .buses
            .iter()
            .position(|bus| bus.scl == scl && bus.sda == sda)
        {
            Some(index) => index,
            None => {
                self.buses.push(SimBus::new(scl, sda));
                self.buses.len() - 1
            }
        };
        &mut self.buses[index]
    }

    fn resettle_bus(&mut self, scl: u8) {
        self.settle(scl, GpioLevel::High);
    }
}

/// In-memory board implementing [`LineDriver`].
///
/// Lines start `Disabled`. Unwired inputs float low unless pulled up or
/// given a level with [`SimBoard::set_input`].
pub struct SimBoard {
    state: Mutex<Board>,
}

impl fmt::Debug for SimBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let board = self.board();
        f.debug_struct("SimBoard")
            .field("lines", &board.lines.len())
            .field("buses", &board.buses.len())
            .finish()
    }
}

impl SimBoard {
    pub fn new(line_count: u8) -> Self {
        let line = SimLine {
            config: LineConfig::Disabled,
            driven: GpioLevel::Low,
            external: None,
            failed: false,
        };
        SimBoard {
            state: Mutex::new(Board {
                lines: vec![line; line_count as usize],
                buses: Vec::new(),
                transitions: VecDeque::with_capacity(256),
            }),
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        lock(&self.state)
    }

    /// Drives `line` from outside, as a button or sensor output would.
    /// `None` lets it float back to its pull.
    pub fn set_input(&self, line: u8, level: Option<GpioLevel>) {
        let mut board = self.board();
        if let Some(sim) = board.lines.get_mut(line as usize) {
            let before = sim.level();
            sim.external = level;
            board.settle(line, before);
        }
    }

    /// Level currently present on a line.
    pub fn level(&self, line: u8) -> GpioLevel {
        self.board().level(line)
    }

    /// Electrical configuration currently applied to a line.
    pub fn config(&self, line: u8) -> Option<LineConfig> {
        self.board().lines.get(line as usize).map(|sim| sim.config)
    }

    /// Recorded level changes on `line`, oldest first. Only the latest
    /// [`TRANSITION_LIMIT`] changes across the board are kept.
    pub fn transitions(&self, line: u8) -> Vec<Transition> {
        self.board()
            .transitions
            .iter()
            .filter(|t| t.line == line)
            .copied()
            .collect()
    }

    pub fn clear_transitions(&self) {
        self.board().transitions.clear();
    }

    /// Wires `scl`/`sda` as an I2C bus, if not already, and attaches `target`.
    pub fn attach_i2c(&self, scl: u8, sda: u8, target: Box<dyn I2cTarget>) {
        self.board().bus_mut(scl, sda).targets.push(target);
    }

    /// Holds SCL of the bus on `scl`/`sda` low, like a target stretching
    /// the clock forever.
    pub fn hold_scl_low(&self, scl: u8, sda: u8, hold: bool) {
        let mut board = self.board();
        board.bus_mut(scl, sda).scl_held = hold;
        board.resettle_bus(scl);
    }

    /// Holds SDA of the bus on `scl`/`sda` low, like a wedged target.
    pub fn hold_sda_low(&self, scl: u8, sda: u8, hold: bool) {
        let mut board = self.board();
        board.bus_mut(scl, sda).sda_held = hold;
        board.resettle_bus(scl);
    }

    /// Makes the bus on `scl`/`sda` wedge partway through a read: once the
    /// selected target has sent `bytes` bytes, SCL is held low as by
    /// [`SimBoard::hold_scl_low`]. Release it with `hold_scl_low(.., false)`.
    pub fn stall_scl_after_reads(&self, scl: u8, sda: u8, bytes: usize) {
        self.board().bus_mut(scl, sda).stall_after = Some(bytes);
    }

    /// Makes every access to `line` fail with `HardwareFault`.
    pub fn fail_line(&self, line: u8, failed: bool) {
        if let Some(sim) = self.board().lines.get_mut(line as usize) {
            sim.failed = failed;
        }
    }
}

impl LineDriver for SimBoard {
    fn line_count(&self) -> u8 {
        self.board().lines.len() as u8
    }

    fn configure(&self, line: u8, config: LineConfig) -> Result<()> {
        let mut board = self.board();
        board.check(line)?;
        let before = board.level(line);
        board.lines[line as usize].config = config;
        board.settle(line, before);
        Ok(())
    }

    fn write(&self, line: u8, level: GpioLevel) -> Result<()> {
        let mut board = self.board();
        board.check(line)?;
        let before = board.level(line);
        board.lines[line as usize].driven = level;
        board.settle(line, before);
        Ok(())
    }

    fn read(&self, line: u8) -> Result<GpioLevel> {
        let board = self.board();
        board.check(line)?;
        Ok(board.level(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pull_records_transitions() {
        let board = SimBoard::new(4);
        board.configure(1, LineConfig::PushPull).unwrap();
        board.write(1, GpioLevel::High).unwrap();
        board.write(1, GpioLevel::High).unwrap();
        board.write(1, GpioLevel::Low).unwrap();
        let levels: Vec<_> = board.transitions(1).iter().map(|t| t.level).collect();
        assert_eq!(levels, vec![GpioLevel::High, GpioLevel::Low]);
    }

    #[test]
    fn test_transition_log_is_bounded() {
        let board = SimBoard::new(2);
        board.configure(0, LineConfig::PushPull).unwrap();
        for i in 0..TRANSITION_LIMIT + 10 {
            board.write(0, GpioLevel::from(i % 2 == 0)).unwrap();
        }
        let kept = board.transitions(0);
        assert_eq!(kept.len(), TRANSITION_LIMIT);
        // The newest change is still there
        assert_eq!(kept.last().map(|t| t.level), Some(GpioLevel::Low));
        board.clear_transitions();
        assert!(board.transitions(0).is_empty());
    }

    #[test]
    fn test_input_pulls_and_injection() {
        let board = SimBoard::new(4);
        board.configure(0, LineConfig::Input(GpioPull::Up)).unwrap();
        assert_eq!(board.read(0).unwrap(), GpioLevel::High);
        board.set_input(0, Some(GpioLevel::Low));
        assert_eq!(board.read(0).unwrap(), GpioLevel::Low);
        board.set_input(0, None);
        assert_eq!(board.read(0).unwrap(), GpioLevel::High);
    }

    #[test]
    fn test_wired_and_bus_lines() {
        let board = SimBoard::new(4);
        board.attach_i2c(2, 3, Box::new(RegisterDevice::new(0x48)));
        board.configure(2, LineConfig::OpenDrain).unwrap();
        board.write(2, GpioLevel::High).unwrap();
        assert_eq!(board.read(2).unwrap(), GpioLevel::High);
        board.hold_scl_low(2, 3, true);
        assert_eq!(board.read(2).unwrap(), GpioLevel::Low);
        board.hold_scl_low(2, 3, false);
        assert_eq!(board.read(2).unwrap(), GpioLevel::High);
    }

    #[test]
    fn test_failed_line() {
        let board = SimBoard::new(2);
        board.fail_line(1, true);
        assert!(board.write(1, GpioLevel::High).is_err());
        assert!(board.read(0).is_ok());
    }

    #[test]
    fn test_register_device_pointer() {
        let mut device = RegisterDevice::with_registers(0x48, &[(0x00, 0x19), (0x01, 0x40)]);
        device.start(false);
        assert!(device.write(0x00));
        device.start(true);
        assert_eq!(device.read(), 0x19);
        assert_eq!(device.read(), 0x40);
    }
}
