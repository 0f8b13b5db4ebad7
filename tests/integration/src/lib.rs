//! Integration tests for the Nightwatch coordinator
//!
//! This test suite validates:
//! - the weather and priority scenarios end to end through the coordinator
//! - aggregation, arbitration, sequencing and ephemeris properties
//! - a full session over TCP against the running server

pub mod test_utils;

#[cfg(test)]
mod scenario_tests;

#[cfg(test)]
mod property_tests;

#[cfg(test)]
mod diurnal_cycle_tests;

#[cfg(test)]
mod tcp_session_tests;
