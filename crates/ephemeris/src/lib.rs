//! Solar ephemeris and the diurnal schedule of the observatory.
//!
//! Everything here is a pure function of observer position and time. The
//! coordinator calls [`DiurnalSchedule::next_event`] whenever the cached
//! transition instant has passed.

pub mod diurnal;
pub mod error;
pub mod riseset;
pub mod solar;

pub use diurnal::{next_event, night_window, DiurnalEvent, DiurnalSchedule, NightWindow};
pub use error::{EphemerisError, Result};
pub use riseset::{Crossing, CrossingKind, Horizons};
pub use solar::{julian_day, sun_equatorial, sun_position, Horizontal, Observer};
