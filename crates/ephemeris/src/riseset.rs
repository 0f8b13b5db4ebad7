//! Horizon-crossing search.
//!
//! Crossings are searched one UTC calendar day at a time on a fixed grid and
//! refined by bisection to a whole second. The grid is anchored to midnight,
//! so the same crossing always resolves to the same second no matter which
//! instant the search started from.

use crate::solar::{sun_altitude, Observer};

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;
const GRID_STEP: i64 = 600;

/// Kind of horizon crossing, in the order they occur over one night
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CrossingKind {
    /// Sun sets below the day horizon
    DaySet,
    /// Sun sets below the night horizon
    NightSet,
    /// Sun rises above the night horizon
    NightRise,
    /// Sun rises above the day horizon
    DayRise,
}

/// One horizon crossing at a whole Unix second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub at: i64,
    pub kind: CrossingKind,
}

/// Night and day horizon altitudes, degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizons {
    pub night: f64,
    pub day: f64,
}

/// All crossings of both horizons within the UTC day starting at `day_start`.
///
/// An interval belongs to the day holding its left grid point, so a crossing
/// is reported by exactly one day.
pub(crate) fn crossings_on_day(
    observer: &Observer,
    day_start: i64,
    horizons: Horizons,
) -> Vec<Crossing> {
    let samples: Vec<(i64, f64)> = (0..=SECONDS_PER_DAY / GRID_STEP)
        .map(|k| {
            let t = day_start + k * GRID_STEP;
            (t, sun_altitude(observer, t))
        })
        .collect();

    let mut found = Vec::new();
    for pair in samples.windows(2) {
        let (t0, alt0) = pair[0];
        let (t1, alt1) = pair[1];
        for (horizon, set_kind, rise_kind) in [
            (horizons.day, CrossingKind::DaySet, CrossingKind::DayRise),
            (horizons.night, CrossingKind::NightSet, CrossingKind::NightRise),
        ] {
            let above0 = alt0 >= horizon;
            let above1 = alt1 >= horizon;
            if above0 == above1 {
                continue;
            }
            let at = bisect(observer, horizon, t0, t1, above0);
            let kind = if above0 { set_kind } else { rise_kind };
            found.push(Crossing { at, kind });
        }
    }
    sort_crossings(&mut found);
    found
}

/// First whole second at which the sun is on the far side of `horizon`.
fn bisect(observer: &Observer, horizon: f64, mut lo: i64, mut hi: i64, above_lo: bool) -> i64 {
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if (sun_altitude(observer, mid) >= horizon) == above_lo {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

pub(crate) fn sort_crossings(crossings: &mut [Crossing]) {
    crossings.sort_by_key(|c| (c.at, c.kind));
}
