//! Status register bit layout shared by devices and the coordinator.
//!
//! Every peer owns one 32-bit register. The coordinator interprets only
//! three categories of bits: the weather flag, the stop flag and the
//! block-operation (BOP) bits. The low byte carries device-specific state;
//! for devices taking part in the facility open/close sequence it holds the
//! open/close bits defined here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Set when the device reports weather unsafe for an open facility.
pub const BAD_WEATHER: u32 = 0x8000_0000;
/// Weather category mask.
pub const WEATHER_MASK: u32 = 0x8000_0000;

/// Set when the device demands that all motion stops.
pub const STOP_EVERYTHING: u32 = 0x4000_0000;
/// Stop category mask.
pub const STOP_MASK: u32 = 0x4000_0000;

/// Block-operation category mask.
pub const BOP_MASK: u32 = 0x3f00_0000;
/// Exposure in progress; blocks operations which would spoil it.
pub const BOP_EXPOSURE: u32 = 0x0100_0000;
/// Readout in progress.
pub const BOP_READOUT: u32 = 0x0200_0000;
/// Telescope may not move.
pub const BOP_TEL_MOVE: u32 = 0x0400_0000;
/// Exposure is about to start.
pub const BOP_WILL_EXPOSE: u32 = 0x0800_0000;
/// Waiting for an exposure trigger.
pub const BOP_TRIG_EXPOSE: u32 = 0x1000_0000;

/// Device error bits; an error reported while opening or closing fails the step.
pub const DEVICE_ERROR_MASK: u32 = 0x000f_0000;

/// Open/close state mask (dome, roof, covers).
pub const OPEN_CLOSE_MASK: u32 = 0x01f;
/// Fully closed.
pub const OC_CLOSED: u32 = 0x001;
/// Opening in progress.
pub const OC_OPENING: u32 = 0x002;
/// Fully opened.
pub const OC_OPENED: u32 = 0x004;
/// Closing in progress.
pub const OC_CLOSING: u32 = 0x008;

/// Diurnal phase bits of the system register.
pub const PHASE_MASK: u32 = 0x00f;
/// On/standby/off bits of the system register.
pub const POWER_MASK: u32 = 0x030;

/// A peer status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord(pub u32);

impl StatusWord {
    /// Register a freshly lost peer is treated as reporting.
    pub const WORST_CASE: StatusWord = StatusWord(BAD_WEATHER | STOP_EVERYTHING);

    /// Raw register value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if the weather bit reports unsafe conditions
    pub fn bad_weather(self) -> bool {
        self.0 & WEATHER_MASK == BAD_WEATHER
    }

    /// True if the device still permits telescope motion
    pub fn can_move(self) -> bool {
        self.0 & STOP_MASK == 0
    }

    /// Raw block-operation bits
    pub fn bop(self) -> u32 {
        self.0 & BOP_MASK
    }

    /// True if any device error bit is set
    pub fn has_error(self) -> bool {
        self.0 & DEVICE_ERROR_MASK != 0
    }

    /// Open/close bits
    pub fn open_close(self) -> u32 {
        self.0 & OPEN_CLOSE_MASK
    }

    /// True if the device reports itself fully opened
    pub fn is_opened(self) -> bool {
        self.open_close() & OC_OPENED != 0
    }

    /// True if the device reports itself fully closed
    pub fn is_closed(self) -> bool {
        self.open_close() & OC_CLOSED != 0
    }

    /// True if any bit under `mask` differs between the two registers
    pub fn toggled(self, other: StatusWord, mask: u32) -> bool {
        (self.0 ^ other.0) & mask != 0
    }

    /// Replace the bits under `mask` with `value`
    pub fn masked(self, mask: u32, value: u32) -> StatusWord {
        StatusWord((self.0 & !mask) | (value & mask))
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StatusWord {
    fn from(value: u32) -> Self {
        StatusWord(value)
    }
}
