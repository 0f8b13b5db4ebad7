//! Diurnal schedule across locations and seasons

use chrono::{DateTime, Duration, TimeZone, Utc};
use nightwatch_core::DiurnalPhase;
use nightwatch_ephemeris::{DiurnalSchedule, Observer};

fn schedule(latitude: f64, longitude: f64) -> DiurnalSchedule {
    DiurnalSchedule {
        observer: Observer::new(latitude, longitude, 0.0),
        night_horizon: -10.0,
        day_horizon: 0.0,
        evening_pad: std::time::Duration::from_secs(7200),
        morning_pad: std::time::Duration::from_secs(1800),
    }
}

fn sites() -> Vec<(&'static str, DiurnalSchedule, DateTime<Utc>)> {
    vec![
        (
            "central europe equinox",
            schedule(50.0, 15.0),
            Utc.with_ymd_and_hms(2024, 3, 20, 6, 0, 0).unwrap(),
        ),
        (
            "central europe winter",
            schedule(50.0, 15.0),
            Utc.with_ymd_and_hms(2024, 12, 21, 0, 0, 0).unwrap(),
        ),
        (
            "southern winter",
            schedule(-33.9, 151.2),
            Utc.with_ymd_and_hms(2024, 6, 21, 3, 0, 0).unwrap(),
        ),
        (
            "equator",
            schedule(0.0, 0.0),
            Utc.with_ymd_and_hms(2024, 9, 1, 18, 30, 0).unwrap(),
        ),
        (
            "pacific summit",
            schedule(19.8, -155.5),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        ),
    ]
}

#[test]
fn test_phases_cycle_in_order_with_increasing_times() {
    for (site, schedule, start) in sites() {
        let mut event = schedule.next_event(start).unwrap();
        let mut last = start;
        for _ in 0..30 {
            assert!(event.next_time > last, "{}: time went backwards at {}", site, last);
            assert_eq!(event.next, event.current.next(), "{}: phase skipped", site);
            last = event.next_time;
            let following = schedule.next_event(event.next_time).unwrap();
            assert_eq!(following.current, event.next, "{}", site);
            event = following;
        }
    }
}

#[test]
fn test_next_transition_does_not_depend_on_query_instant() {
    for (site, schedule, start) in sites() {
        let first = schedule.next_event(start).unwrap();
        let since = first.current_since.unwrap_or(start);
        let midpoint = since + (first.next_time - since) / 2;
        let again = schedule.next_event(midpoint).unwrap();
        assert_eq!(again.next_time, first.next_time, "{}", site);
        assert_eq!(again.current, first.current, "{}", site);
        assert_eq!(schedule.next_event(start).unwrap(), first, "{}", site);
    }
}

#[test]
fn test_night_window_brackets_the_night_phase() {
    for (site, schedule, start) in sites() {
        let window = schedule.night_window(start).unwrap();
        assert!(window.stop > window.start, "{}", site);
        assert!(window.stop - window.start < Duration::hours(24), "{}", site);

        let inside = window.start + (window.stop - window.start) / 2;
        let event = schedule.next_event(inside).unwrap();
        assert_eq!(event.current, DiurnalPhase::Night, "{}", site);
        assert_eq!(event.next_time, window.stop, "{}", site);
        assert_eq!(event.current_since, Some(window.start), "{}", site);
    }
}

#[test]
fn test_sun_is_up_by_day_and_down_by_night() {
    for (site, schedule, start) in sites() {
        let window = schedule.night_window(start).unwrap();
        let inside = window.start + Duration::minutes(30);
        assert!(schedule.sun_position(inside).altitude < -10.0, "{}", site);
        let noon = window.stop + Duration::hours(6);
        if schedule.next_event(noon).unwrap().current == DiurnalPhase::Day {
            assert!(schedule.sun_position(noon).altitude > 0.0, "{}", site);
        }
    }
}
