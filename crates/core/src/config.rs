//! Configuration management for Nightwatch.
//!
//! The coordinator reads one TOML file at startup (and again on SIGHUP).
//! Everything here is plain data; validation only fixes up values the
//! coordinator cannot work with.

use crate::error::{CoreError, Result};
use crate::types::MorningPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound for every timeout and interval, seconds
pub const MAX_TIMEOUT_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub observatory: ObservatoryConfig,
    #[serde(default)]
    pub centrald: CentraldConfig,
    /// Device name -> devices whose BOP bits may block it
    #[serde(default)]
    pub blocking: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatoryConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default = "default_night_horizon")]
    pub night_horizon: f64,
    #[serde(default)]
    pub day_horizon: f64,
    /// Camera cool-down pad, seconds
    #[serde(default = "default_evening_time")]
    pub evening_time: u64,
    /// Camera warm-up pad, seconds
    #[serde(default = "default_morning_time")]
    pub morning_time: u64,
    #[serde(default)]
    pub required_devices: Vec<String>,
    /// Facility open order; closing walks it backwards
    #[serde(default)]
    pub open_sequence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentraldConfig {
    pub listen: String,
    pub morning_off: bool,
    pub morning_standby: bool,
    pub reboot_on: bool,
    /// Seconds a revoked priority holder gets to finish
    pub priority_grace: u64,
    pub sequence_step_timeout: u64,
    pub status_timeout: u64,
    pub tick_interval_ms: u64,
    pub info_interval: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_night_horizon() -> f64 {
    -10.0
}

fn default_evening_time() -> u64 {
    7200
}

fn default_morning_time() -> u64 {
    1800
}

impl Default for CentraldConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:617".to_string(),
            morning_off: true,
            morning_standby: true,
            reboot_on: false,
            priority_grace: 180,
            sequence_step_timeout: 180,
            status_timeout: 60,
            tick_interval_ms: 1000,
            info_interval: 300,
        }
    }
}

impl CentraldConfig {
    pub fn morning_policy(&self) -> MorningPolicy {
        if self.morning_off {
            MorningPolicy::Off
        } else if self.morning_standby {
            MorningPolicy::Standby
        } else {
            MorningPolicy::Nothing
        }
    }

    pub fn priority_grace_duration(&self) -> Duration {
        Duration::from_secs(self.priority_grace)
    }

    pub fn step_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.sequence_step_timeout)
    }

    pub fn status_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.status_timeout)
    }

    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn info_interval_duration(&self) -> Duration {
        Duration::from_secs(self.info_interval.max(1))
    }
}

impl ObservatoryConfig {
    pub fn evening_pad(&self) -> Duration {
        Duration::from_secs(self.evening_time)
    }

    pub fn morning_pad(&self) -> Duration {
        Duration::from_secs(self.morning_time)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unusable values and repair the horizon pair.
    pub fn validate(&mut self) -> Result<()> {
        let obs = &mut self.observatory;
        if !(-90.0..=90.0).contains(&obs.latitude) {
            return Err(CoreError::Config(format!(
                "latitude {} out of range",
                obs.latitude
            )));
        }
        if !(-180.0..=360.0).contains(&obs.longitude) {
            return Err(CoreError::Config(format!(
                "longitude {} out of range",
                obs.longitude
            )));
        }
        if obs.day_horizon < obs.night_horizon {
            let mut fixed = 0.0;
            if fixed < obs.night_horizon {
                fixed = obs.night_horizon + 1.0;
            }
            tracing::error!(
                day_horizon = obs.day_horizon,
                night_horizon = obs.night_horizon,
                "day_horizon must be higher than night_horizon, setting it to {}",
                fixed
            );
            obs.day_horizon = fixed;
        }
        if let Some(dup) = first_duplicate(&obs.open_sequence) {
            return Err(CoreError::Config(format!(
                "device {} listed twice in open_sequence",
                dup
            )));
        }

        let centrald = &mut self.centrald;
        for (name, value) in [
            ("priority_grace", &mut centrald.priority_grace),
            ("sequence_step_timeout", &mut centrald.sequence_step_timeout),
            ("status_timeout", &mut centrald.status_timeout),
            ("info_interval", &mut centrald.info_interval),
        ] {
            clamp_secs(name, value, MAX_TIMEOUT_SECS);
        }
        clamp_secs(
            "tick_interval_ms",
            &mut centrald.tick_interval_ms,
            MAX_TIMEOUT_SECS * 1000,
        );
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            observatory: ObservatoryConfig {
                latitude: 50.0,
                longitude: 15.0,
                altitude: 300.0,
                night_horizon: default_night_horizon(),
                day_horizon: 0.0,
                evening_time: default_evening_time(),
                morning_time: default_morning_time(),
                required_devices: Vec::new(),
                open_sequence: Vec::new(),
            },
            centrald: CentraldConfig::default(),
            blocking: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

fn clamp_secs(name: &str, value: &mut u64, max: u64) {
    if *value > max {
        tracing::warn!(setting = name, value = *value, max, "value too large, clamped");
        *value = max;
    }
}

fn first_duplicate(names: &[String]) -> Option<&str> {
    names
        .iter()
        .enumerate()
        .find(|(i, name)| names[..*i].contains(*name))
        .map(|(_, name)| name.as_str())
}
