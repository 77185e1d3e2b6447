//! Internal constants: bus timing limits and XR2280x register addresses.

// --- I2C Related Constants ---
pub mod i2c {
    /// Upper bit rate of each I2C mode.
    pub const STANDARD_MODE_HZ: u32 = 100_000;
    pub const FAST_MODE_HZ: u32 = 400_000;
    pub const FAST_MODE_PLUS_HZ: u32 = 1_000_000;

    // Minimum SCL low/high times per mode (UM10204, table 10)
    pub const STANDARD_MIN_LOW_NS: u64 = 4_700;
    pub const STANDARD_MIN_HIGH_NS: u64 = 4_000;
    pub const FAST_MIN_LOW_NS: u64 = 1_300;
    pub const FAST_MIN_HIGH_NS: u64 = 600;
    pub const FAST_PLUS_MIN_LOW_NS: u64 = 500;
    pub const FAST_PLUS_MIN_HIGH_NS: u64 = 260;
}

// --- XR2280x HID Bridge ---
#[cfg(feature = "xr2280x")]
pub mod xr2280x {
    /// Exar Corporation vendor ID.
    pub const EXAR_VID: u16 = 0x04E2;
    /// Product ID of the EDGE (GPIO/PWM) interface, common for XR22800/1/2/4.
    pub const EDGE_PID: u16 = 0x1200;

    // Feature reports (control transfer)
    pub const REPORT_ID_WRITE_HID_REGISTER: u8 = 0x3C;
    pub const REPORT_ID_SET_HID_READ_ADDRESS: u8 = 0x4B;
    pub const REPORT_ID_READ_HID_REGISTER: u8 = 0x5A;

    /// Lines per register group; group 1 exists on XR22802/4 only.
    pub const GROUP_SIZE: u8 = 16;

    /// Per-group EDGE register offsets, added to the group base.
    pub mod edge {
        pub const GROUP_0_BASE: u16 = 0x03C0;
        pub const GROUP_1_BASE: u16 = 0x03CC;

        pub const FUNC_SEL: u16 = 0x0;
        pub const DIR: u16 = 0x1;
        pub const SET: u16 = 0x2;
        pub const CLEAR: u16 = 0x3;
        pub const STATE: u16 = 0x4;
        pub const TRI_STATE: u16 = 0x5;
        pub const OPEN_DRAIN: u16 = 0x6;
        pub const PULL_UP: u16 = 0x7;
        pub const PULL_DOWN: u16 = 0x8;
    }

    pub mod pwm {
        pub const REG_PWM0_CTRL: u16 = 0x03D8;
        pub const REG_PWM1_CTRL: u16 = 0x03DB;
        // HIGH and LOW follow CTRL
        pub const HIGH_OFFSET: u16 = 1;
        pub const LOW_OFFSET: u16 = 2;

        pub const PIN_MASK: u16 = 0b0000_0000_0001_1111; // Bits 4:0
        pub const ENABLE_MASK: u16 = 0b0000_0000_0010_0000; // Bit 5
        pub const CMD_MASK: u16 = 0b0000_0001_1100_0000; // Bits 8:6
        pub const CMD_SHIFT: u8 = 6;

        pub const CMD_ASSERT_LOW: u16 = 0b100;
        pub const CMD_FREE_RUN: u16 = 0b110;

        // 60 MHz / 16 = 3.75 MHz counter, ~266.667 ns per unit
        pub const UNIT_TIME_NS: f64 = 1_000_000_000.0 / (60_000_000.0 / 16.0);
        pub const MIN_UNITS: u16 = 1;
        pub const MAX_UNITS: u16 = 4095;
    }
}
