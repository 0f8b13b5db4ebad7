//! Low-precision solar position.
//!
//! Accuracy is around a hundredth of a degree in declination, which is far
//! better than the minute-level resolution the diurnal schedule needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Julian day of the Unix epoch
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
/// Julian day of J2000.0
const J2000_JD: f64 = 2_451_545.0;

/// Geographic position of the observatory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    /// Latitude in degrees, north positive
    pub latitude: f64,
    /// Longitude in degrees, east positive
    pub longitude: f64,
    /// Altitude above sea level in metres
    pub altitude: f64,
}

impl Observer {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

impl From<&nightwatch_core::ObservatoryConfig> for Observer {
    fn from(config: &nightwatch_core::ObservatoryConfig) -> Self {
        Self::new(config.latitude, config.longitude, config.altitude)
    }
}

/// Horizontal coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Horizontal {
    /// Altitude above the horizon
    pub altitude: f64,
    /// Azimuth measured from north through east
    pub azimuth: f64,
}

/// Julian day for a UTC instant
pub fn julian_day(at: DateTime<Utc>) -> f64 {
    julian_day_from_unix(at.timestamp() as f64 + f64::from(at.timestamp_subsec_millis()) / 1000.0)
}

pub(crate) fn julian_day_from_unix(unix_secs: f64) -> f64 {
    unix_secs / 86_400.0 + UNIX_EPOCH_JD
}

/// Apparent right ascension and declination of the sun, degrees
pub fn sun_equatorial(jd: f64) -> (f64, f64) {
    let n = jd - J2000_JD;

    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.985_600_3 * n).rem_euclid(360.0).to_radians();

    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let ra = (obliquity.cos() * ecliptic_longitude.sin())
        .atan2(ecliptic_longitude.cos())
        .to_degrees()
        .rem_euclid(360.0);
    let dec = (obliquity.sin() * ecliptic_longitude.sin())
        .asin()
        .to_degrees();
    (ra, dec)
}

/// Greenwich mean sidereal time, degrees
fn greenwich_sidereal(jd: f64) -> f64 {
    (280.460_618_37 + 360.985_647_366_29 * (jd - J2000_JD)).rem_euclid(360.0)
}

fn horizontal_at(observer: &Observer, jd: f64) -> Horizontal {
    let (ra, dec) = sun_equatorial(jd);
    let hour_angle = (greenwich_sidereal(jd) + observer.longitude - ra).to_radians();
    let lat = observer.latitude.to_radians();
    let dec = dec.to_radians();

    let altitude = (lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos())
        .clamp(-1.0, 1.0)
        .asin();
    let azimuth = hour_angle
        .sin()
        .atan2(hour_angle.cos() * lat.sin() - dec.tan() * lat.cos())
        .to_degrees()
        + 180.0;

    Horizontal {
        altitude: altitude.to_degrees(),
        azimuth: azimuth.rem_euclid(360.0),
    }
}

/// Sun position as seen by the observer
pub fn sun_position(observer: &Observer, at: DateTime<Utc>) -> Horizontal {
    horizontal_at(observer, julian_day(at))
}

/// Sun altitude at a whole Unix second
pub(crate) fn sun_altitude(observer: &Observer, unix_secs: i64) -> f64 {
    horizontal_at(observer, julian_day_from_unix(unix_secs as f64)).altitude
}
