//! Core functionality for the Nightwatch observatory coordinator.
//!
//! This crate provides the types shared by every Nightwatch component:
//! the status register layout, diurnal phase and power state, the
//! configuration file format and logging initialization.

pub mod config;
pub mod error;
pub mod logging;
pub mod status;
pub mod types;

pub use config::{CentraldConfig, Config, LogFormat, LoggingConfig, ObservatoryConfig};
pub use error::{CoreError, Result};
pub use status::StatusWord;
pub use types::{DeviceType, DiurnalPhase, MorningPolicy, PowerState};
