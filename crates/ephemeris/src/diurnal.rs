//! Diurnal phase schedule.
//!
//! Phase boundaries are derived from the horizon crossings around the query
//! instant:
//!
//! | boundary | instant |
//! |---|---|
//! | day -> evening | sun sets below the day horizon |
//! | evening -> dusk | day-horizon set + evening pad |
//! | dusk -> night | sun sets below the night horizon |
//! | night -> dawn | sun rises above the night horizon |
//! | dawn -> morning | day-horizon rise - morning pad |
//! | morning -> day | sun rises above the day horizon |
//!
//! A pad never extends past the midpoint to the neighbouring crossing. When
//! the sun stays above the night horizon all night, dawn starts halfway
//! between set and rise and the night phase is skipped.

use crate::error::{EphemerisError, Result};
use crate::riseset::{
    crossings_on_day, sort_crossings, Crossing, CrossingKind, Horizons, SECONDS_PER_DAY,
};
use crate::solar::{sun_altitude, sun_position, Horizontal, Observer};
use chrono::{DateTime, Utc};
use nightwatch_core::{DiurnalPhase, ObservatoryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Days searched forward before giving up on finding a transition
const MAX_SEARCH_DAYS: i64 = 400;
/// Crossings needed on each side of the query instant
const CONTEXT_CROSSINGS: usize = 2;
/// Phase changes walked while looking for the next night
const MAX_WINDOW_EVENTS: usize = 12;

/// Current phase and the next scheduled transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiurnalEvent {
    pub current: DiurnalPhase,
    /// Start of the current phase, `None` if it began before the search window
    pub current_since: Option<DateTime<Utc>>,
    pub next: DiurnalPhase,
    pub next_time: DateTime<Utc>,
}

/// Start and end of a night phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Crossing(CrossingKind),
    WhiteNightDawn,
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    at: i64,
    phase: DiurnalPhase,
}

/// Classify `from` into a diurnal phase and find the next transition.
pub fn next_event(
    observer: &Observer,
    from: DateTime<Utc>,
    night_horizon: f64,
    day_horizon: f64,
    evening_pad: Duration,
    morning_pad: Duration,
) -> Result<DiurnalEvent> {
    let from_secs = from.timestamp();
    let horizons = Horizons {
        night: night_horizon,
        day: day_horizon,
    };

    let crossings = collect_crossings(observer, from_secs, horizons)?;
    let bounds = boundaries(&crossings, pad_secs(evening_pad), pad_secs(morning_pad));

    let next = bounds
        .iter()
        .find(|b| b.at > from_secs)
        .ok_or(EphemerisError::NoTransition {
            from: from_secs,
            days: MAX_SEARCH_DAYS,
        })?;

    let (current, current_since) = match bounds.iter().rev().find(|b| b.at <= from_secs) {
        Some(b) => (b.phase, Some(to_utc(b.at)?)),
        None => (phase_by_altitude(observer, from_secs, horizons), None),
    };

    Ok(DiurnalEvent {
        current,
        current_since,
        next: next.phase,
        next_time: to_utc(next.at)?,
    })
}

/// The night in progress at `from`, or the next one.
pub fn night_window(
    observer: &Observer,
    from: DateTime<Utc>,
    night_horizon: f64,
    day_horizon: f64,
    evening_pad: Duration,
    morning_pad: Duration,
) -> Result<NightWindow> {
    let step = |at| next_event(observer, at, night_horizon, day_horizon, evening_pad, morning_pad);

    let mut event = step(from)?;
    if event.current == DiurnalPhase::Night {
        return Ok(NightWindow {
            start: event.current_since.unwrap_or(from),
            stop: event.next_time,
        });
    }
    for _ in 0..MAX_WINDOW_EVENTS {
        if event.next == DiurnalPhase::Night {
            let start = event.next_time;
            let night = step(start)?;
            return Ok(NightWindow {
                start,
                stop: night.next_time,
            });
        }
        event = step(event.next_time)?;
    }
    Err(EphemerisError::NoNight)
}

/// Observer plus horizons and pads, as read from configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiurnalSchedule {
    pub observer: Observer,
    pub night_horizon: f64,
    pub day_horizon: f64,
    pub evening_pad: Duration,
    pub morning_pad: Duration,
}

impl DiurnalSchedule {
    pub fn from_config(config: &ObservatoryConfig) -> Self {
        Self {
            observer: Observer::from(config),
            night_horizon: config.night_horizon,
            day_horizon: config.day_horizon,
            evening_pad: config.evening_pad(),
            morning_pad: config.morning_pad(),
        }
    }

    pub fn next_event(&self, from: DateTime<Utc>) -> Result<DiurnalEvent> {
        next_event(
            &self.observer,
            from,
            self.night_horizon,
            self.day_horizon,
            self.evening_pad,
            self.morning_pad,
        )
    }

    pub fn night_window(&self, from: DateTime<Utc>) -> Result<NightWindow> {
        night_window(
            &self.observer,
            from,
            self.night_horizon,
            self.day_horizon,
            self.evening_pad,
            self.morning_pad,
        )
    }

    pub fn sun_position(&self, at: DateTime<Utc>) -> Horizontal {
        sun_position(&self.observer, at)
    }
}

fn collect_crossings(observer: &Observer, from: i64, horizons: Horizons) -> Result<Vec<Crossing>> {
    let today = from.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY;
    let limit = MAX_SEARCH_DAYS * SECONDS_PER_DAY;
    let mut crossings = Vec::new();

    let mut later = 0;
    let mut day = today;
    while later < CONTEXT_CROSSINGS {
        if day - today >= limit {
            return Err(EphemerisError::NoTransition {
                from,
                days: MAX_SEARCH_DAYS,
            });
        }
        let found = crossings_on_day(observer, day, horizons);
        later += found.iter().filter(|c| c.at > from).count();
        crossings.extend(found);
        day += SECONDS_PER_DAY;
    }

    // Running short here only loses `current_since`.
    let mut earlier = crossings.iter().filter(|c| c.at <= from).count();
    let mut day = today - SECONDS_PER_DAY;
    while earlier < CONTEXT_CROSSINGS && today - day <= limit {
        let found = crossings_on_day(observer, day, horizons);
        earlier += found.len();
        crossings.extend(found);
        day -= SECONDS_PER_DAY;
    }

    sort_crossings(&mut crossings);
    Ok(crossings)
}

fn boundaries(crossings: &[Crossing], evening_pad: i64, morning_pad: i64) -> Vec<Boundary> {
    let mut anchors: Vec<(i64, Anchor)> = Vec::with_capacity(crossings.len() + 2);
    for (i, crossing) in crossings.iter().enumerate() {
        anchors.push((crossing.at, Anchor::Crossing(crossing.kind)));
        if crossing.kind == CrossingKind::DaySet {
            if let Some(next) = crossings.get(i + 1) {
                if next.kind == CrossingKind::DayRise {
                    let midpoint = crossing.at + (next.at - crossing.at) / 2;
                    anchors.push((midpoint, Anchor::WhiteNightDawn));
                }
            }
        }
    }

    let mut bounds = Vec::with_capacity(anchors.len() + crossings.len());
    for (i, &(at, anchor)) in anchors.iter().enumerate() {
        match anchor {
            Anchor::Crossing(CrossingKind::DaySet) => {
                let room = anchors.get(i + 1).map(|&(next, _)| (next - at) / 2);
                bounds.push(Boundary {
                    at,
                    phase: DiurnalPhase::Evening,
                });
                bounds.push(Boundary {
                    at: at + clamp_pad(evening_pad, room),
                    phase: DiurnalPhase::Dusk,
                });
            }
            Anchor::Crossing(CrossingKind::NightSet) => bounds.push(Boundary {
                at,
                phase: DiurnalPhase::Night,
            }),
            Anchor::Crossing(CrossingKind::NightRise) | Anchor::WhiteNightDawn => {
                bounds.push(Boundary {
                    at,
                    phase: DiurnalPhase::Dawn,
                })
            }
            Anchor::Crossing(CrossingKind::DayRise) => {
                let room = i
                    .checked_sub(1)
                    .and_then(|prev| anchors.get(prev))
                    .map(|&(prev, _)| (at - prev) / 2);
                bounds.push(Boundary {
                    at: at - clamp_pad(morning_pad, room),
                    phase: DiurnalPhase::Morning,
                });
                bounds.push(Boundary {
                    at,
                    phase: DiurnalPhase::Day,
                });
            }
        }
    }

    bounds.sort_by_key(|b| b.at);
    // At a shared instant the last boundary wins.
    let mut collapsed: Vec<Boundary> = Vec::with_capacity(bounds.len());
    for bound in bounds {
        match collapsed.last_mut() {
            Some(last) if last.at == bound.at => *last = bound,
            _ => collapsed.push(bound),
        }
    }
    collapsed
}

fn clamp_pad(pad: i64, room: Option<i64>) -> i64 {
    let pad = pad.max(1);
    match room {
        Some(room) => pad.min(room.max(1)),
        None => pad,
    }
}

fn pad_secs(pad: Duration) -> i64 {
    pad.as_secs().min(SECONDS_PER_DAY as u64) as i64
}

fn phase_by_altitude(observer: &Observer, at: i64, horizons: Horizons) -> DiurnalPhase {
    let altitude = sun_altitude(observer, at);
    if altitude >= horizons.day {
        DiurnalPhase::Day
    } else if altitude < horizons.night {
        DiurnalPhase::Night
    } else if sun_altitude(observer, at + 600) > altitude {
        DiurnalPhase::Dawn
    } else {
        DiurnalPhase::Dusk
    }
}

fn to_utc(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or(EphemerisError::TimeOutOfRange(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(latitude: f64, longitude: f64, evening: u64, morning: u64) -> DiurnalSchedule {
        DiurnalSchedule {
            observer: Observer::new(latitude, longitude, 0.0),
            night_horizon: -10.0,
            day_horizon: 0.0,
            evening_pad: Duration::from_secs(evening),
            morning_pad: Duration::from_secs(morning),
        }
    }

    #[test]
    fn test_noon_is_day_and_midnight_is_night() {
        let s = schedule(50.0, 15.0, 7200, 1800);
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 11, 7, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 20, 23, 7, 0).unwrap();

        let day = s.next_event(noon).unwrap();
        assert_eq!(day.current, DiurnalPhase::Day);
        assert_eq!(day.next, DiurnalPhase::Evening);
        assert!(day.current_since.unwrap() < noon);
        assert!(day.next_time > noon);

        let night = s.next_event(midnight).unwrap();
        assert_eq!(night.current, DiurnalPhase::Night);
        assert_eq!(night.next, DiurnalPhase::Dawn);
    }

    #[test]
    fn test_advancing_cycles_through_every_phase() {
        let s = schedule(50.0, 15.0, 7200, 1800);
        let mut event = s
            .next_event(Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap())
            .unwrap();
        assert_eq!(event.current, DiurnalPhase::Day);

        for _ in 0..36 {
            assert_eq!(event.next, event.current.next());
            let following = s.next_event(event.next_time).unwrap();
            assert_eq!(following.current, event.next);
            assert_eq!(following.current_since, Some(event.next_time));
            assert!(following.next_time > event.next_time);
            event = following;
        }
    }

    #[test]
    fn test_pads_are_clamped_to_midpoint() {
        let s = schedule(50.0, 15.0, 7200, 900);
        let mut starts = std::collections::HashMap::new();
        let mut event = s
            .next_event(Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap())
            .unwrap();
        for _ in 0..6 {
            starts.insert(event.next, event.next_time.timestamp());
            event = s.next_event(event.next_time).unwrap();
        }
        let evening = starts[&DiurnalPhase::Evening];
        let dusk = starts[&DiurnalPhase::Dusk];
        let night = starts[&DiurnalPhase::Night];
        // the sun needs about an hour to reach -10 degrees, less than the pad
        assert!(night - evening < 7200);
        assert_eq!(dusk - evening, (night - evening) / 2);
        assert_eq!(starts[&DiurnalPhase::Day] - starts[&DiurnalPhase::Morning], 900);
    }

    #[test]
    fn test_small_pads_are_applied_exactly() {
        let s = schedule(50.0, 15.0, 600, 600);
        let mut event = s
            .next_event(Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap())
            .unwrap();
        let evening = event.next_time;
        event = s.next_event(evening).unwrap();
        assert_eq!(event.next, DiurnalPhase::Dusk);
        assert_eq!((event.next_time - evening).num_seconds(), 600);
    }

    #[test]
    fn test_white_night_skips_night() {
        let s = schedule(60.0, 25.0, 7200, 1800);
        let mut event = s
            .next_event(Utc.with_ymd_and_hms(2024, 6, 21, 10, 0, 0).unwrap())
            .unwrap();
        assert_eq!(event.current, DiurnalPhase::Day);
        let mut seen = vec![event.current];
        for _ in 0..5 {
            event = s.next_event(event.next_time).unwrap();
            seen.push(event.current);
        }
        assert_eq!(
            seen,
            vec![
                DiurnalPhase::Day,
                DiurnalPhase::Evening,
                DiurnalPhase::Dusk,
                DiurnalPhase::Dawn,
                DiurnalPhase::Morning,
                DiurnalPhase::Day,
            ]
        );
        assert_eq!(
            s.night_window(Utc.with_ymd_and_hms(2024, 6, 21, 10, 0, 0).unwrap()),
            Err(EphemerisError::NoNight)
        );
    }

    #[test]
    fn test_polar_day_next_transition_is_weeks_away() {
        let s = schedule(80.0, 15.0, 7200, 1800);
        let from = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        let event = s.next_event(from).unwrap();
        assert_eq!(event.current, DiurnalPhase::Day);
        assert_eq!(event.next, DiurnalPhase::Evening);
        assert!(event.next_time - from > chrono::Duration::days(30));
        assert!(event.current_since.is_some());
    }

    #[test]
    fn test_night_window_inside_and_before_night() {
        let s = schedule(50.0, 15.0, 7200, 1800);
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let window = s.night_window(noon).unwrap();
        assert!(window.start > noon);
        assert!(window.stop > window.start);

        let inside = window.start + chrono::Duration::hours(1);
        assert_eq!(s.night_window(inside).unwrap(), window);
    }
}
