//! Deadline arithmetic shared by the timers

use chrono::{DateTime, Duration, Utc};
use nightwatch_core::config::MAX_TIMEOUT_SECS;

/// Convert a configured duration, saturating at the longest allowed timeout
pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    let secs = duration.as_secs().min(MAX_TIMEOUT_SECS);
    Duration::seconds(secs as i64)
}

/// `now + duration`, saturating instead of overflowing
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(duration)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating instead of overflowing
pub(crate) fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(duration)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
