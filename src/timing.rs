//! Centralized time handling.
//!
//! On-disk state uses naive UTC; filenames use local time; durations are
//! millisecond integers formatted hierarchically for humans.

use chrono::{DateTime, Local, NaiveDateTime, Utc};

const MS_PER_SECOND: i64 = 1_000;
const SECONDS_PER_MINUTE: i64 = 60;
const MINUTES_PER_DAY: i64 = 24 * 60;

/// Current UTC time with timezone info, for API timestamps and events.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC time without timezone info, for state persistence.
pub fn utc_now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Current local time, for filenames and human-readable output.
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Duration between two naive timestamps in milliseconds, floored at zero.
pub fn duration_ms(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    (end - start).num_milliseconds().max(0)
}

/// Milliseconds elapsed since `start`.
pub fn elapsed_ms(start: NaiveDateTime) -> i64 {
    duration_ms(start, utc_now_naive())
}

/// Compact timestamp for filenames: YYYYMMDD-HHMMSS (local time).
pub fn format_timestamp(dt: NaiveDateTime) -> String {
    dt.format("%Y%m%d-%H%M%S").to_string()
}

/// Local date for filenames: YYYYMMDD.
pub fn format_local_date(dt: NaiveDateTime) -> String {
    dt.format("%Y%m%d").to_string()
}

/// ISO timestamp with microseconds for snapshot filenames.
pub fn format_iso_micros(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H-%M-%S%.6f").to_string()
}

/// Format milliseconds as a human-readable duration.
///
/// - `< 1h`: `"{m}m {s}s"` ("2m 14s", "47m", "30s"), zero components omitted
/// - `1-24h`: `"{h}h {m}m"` ("2h 17m"), zero minutes omitted
/// - `>= 24h`: `"{d}d {h}h"` ("1d 5h"), zero hours omitted
///
/// Negative inputs clamp to `"0s"`.
pub fn format_duration(milliseconds: i64) -> String {
    let ms = milliseconds.max(0);
    let total_seconds = ms / MS_PER_SECOND;

    let total_minutes = total_seconds / SECONDS_PER_MINUTE;
    let seconds = total_seconds % SECONDS_PER_MINUTE;
    let days = total_minutes / MINUTES_PER_DAY;
    let remaining_minutes = total_minutes % MINUTES_PER_DAY;
    let hours = remaining_minutes / 60;
    let minutes = remaining_minutes % 60;

    if days > 0 {
        if hours > 0 {
            format!("{days}d {hours}h")
        } else {
            format!("{days}d")
        }
    } else if hours > 0 {
        if minutes > 0 {
            format!("{hours}h {minutes}m")
        } else {
            format!("{hours}h")
        }
    } else if minutes > 0 {
        if seconds > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{minutes}m")
        }
    } else {
        format!("{seconds}s")
    }
}
