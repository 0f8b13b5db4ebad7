//! Ephemeris error types

use thiserror::Error;

/// Errors from the diurnal schedule computation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EphemerisError {
    /// The sun never crosses either horizon within the search limit
    #[error("No phase transition within {days} days after unix time {from}")]
    NoTransition { from: i64, days: i64 },

    /// The sun never reaches the night horizon in the searched cycles
    #[error("No night in the searched interval")]
    NoNight,

    /// A computed instant cannot be represented as a UTC timestamp
    #[error("Time out of range: {0}")]
    TimeOutOfRange(i64),
}

/// Result alias for ephemeris operations
pub type Result<T> = std::result::Result<T, EphemerisError>;
