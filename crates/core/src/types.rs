//! Core types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diurnal phase of the observatory, ordered as the sun moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiurnalPhase {
    /// Sun above the day horizon
    Day,
    /// After sunset, cameras cooling down
    Evening,
    /// Twilight between cool-down and the night horizon
    Dusk,
    /// Sun below the night horizon
    Night,
    /// Morning twilight
    Dawn,
    /// Before sunrise, cameras warming up
    Morning,
}

impl DiurnalPhase {
    /// All phases in cycle order
    pub const ALL: [DiurnalPhase; 6] = [
        DiurnalPhase::Day,
        DiurnalPhase::Evening,
        DiurnalPhase::Dusk,
        DiurnalPhase::Night,
        DiurnalPhase::Dawn,
        DiurnalPhase::Morning,
    ];

    /// Phase following this one in the cycle
    pub fn next(self) -> DiurnalPhase {
        Self::ALL[(self.code() as usize + 1) % Self::ALL.len()]
    }

    /// Numeric code carried in the system register
    pub fn code(self) -> u32 {
        match self {
            DiurnalPhase::Day => 0,
            DiurnalPhase::Evening => 1,
            DiurnalPhase::Dusk => 2,
            DiurnalPhase::Night => 3,
            DiurnalPhase::Dawn => 4,
            DiurnalPhase::Morning => 5,
        }
    }

    /// Phases during which the facility may be open
    pub fn is_dark(self) -> bool {
        matches!(
            self,
            DiurnalPhase::Dusk | DiurnalPhase::Night | DiurnalPhase::Dawn
        )
    }

    /// Lowercase name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            DiurnalPhase::Day => "day",
            DiurnalPhase::Evening => "evening",
            DiurnalPhase::Dusk => "dusk",
            DiurnalPhase::Night => "night",
            DiurnalPhase::Dawn => "dawn",
            DiurnalPhase::Morning => "morning",
        }
    }
}

impl fmt::Display for DiurnalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On/off state of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Fully automatic operation
    On,
    /// Running, but the facility stays closed
    Standby,
    /// Off, devices finish what they are doing
    SoftOff,
    /// Off
    HardOff,
}

impl PowerState {
    /// Bits carried in the system register
    pub fn bits(self) -> u32 {
        match self {
            PowerState::On => 0x000,
            PowerState::Standby => 0x010,
            PowerState::SoftOff => 0x020,
            PowerState::HardOff => 0x030,
        }
    }

    /// True for either off state
    pub fn is_off(self) -> bool {
        matches!(self, PowerState::SoftOff | PowerState::HardOff)
    }

    /// Name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Standby => "standby",
            PowerState::SoftOff => "soft_off",
            PowerState::HardOff => "off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the coordinator does when the morning turns into day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MorningPolicy {
    /// Switch the system off
    Off,
    /// Switch the system to standby
    Standby,
    /// Keep the current power state
    Nothing,
}

/// Device class declared at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Unknown device class
    Unknown,
    /// Telescope mount
    Mount,
    /// CCD or CMOS camera
    Camera,
    /// Dome or roll-off roof
    Dome,
    /// Weather station or safety sensor
    Weather,
    /// Field rotator
    Rotator,
    /// Photometer
    Photometer,
    /// Focuser
    Focuser,
    /// Mirror or mirror cover
    Mirror,
    /// Cupola
    Cupola,
    /// Filter wheel
    FilterWheel,
    /// Generic sensor or auxiliary actuator
    Sensor,
    /// Observation executor
    Executor,
    /// Any other declared class
    Other(i32),
}

impl DeviceType {
    /// Decode the numeric device class used in registration
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DeviceType::Unknown,
            2 => DeviceType::Mount,
            3 => DeviceType::Camera,
            4 => DeviceType::Dome,
            5 => DeviceType::Weather,
            6 => DeviceType::Rotator,
            7 => DeviceType::Photometer,
            10 => DeviceType::Focuser,
            11 => DeviceType::Mirror,
            12 => DeviceType::Cupola,
            13 => DeviceType::FilterWheel,
            15 => DeviceType::Sensor,
            20 => DeviceType::Executor,
            other => DeviceType::Other(other),
        }
    }

    /// Numeric device class
    pub fn code(self) -> i32 {
        match self {
            DeviceType::Unknown => 0,
            DeviceType::Mount => 2,
            DeviceType::Camera => 3,
            DeviceType::Dome => 4,
            DeviceType::Weather => 5,
            DeviceType::Rotator => 6,
            DeviceType::Photometer => 7,
            DeviceType::Focuser => 10,
            DeviceType::Mirror => 11,
            DeviceType::Cupola => 12,
            DeviceType::FilterWheel => 13,
            DeviceType::Sensor => 15,
            DeviceType::Executor => 20,
            DeviceType::Other(code) => code,
        }
    }
}
