//! Human-readable rendering of byte counts, ages and durations

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::time::Duration;

const BYTE_UNITS: [&str; 5] = ["B", "Ki", "Mi", "Gi", "Ti"];

/// Render a byte count in binary units, e.g. `1.5 Ki`.
///
/// The unit is `floor(log1024(bytes))`, capped at `Ti`; the value keeps at
/// most two decimals with trailing zeros dropped.
pub fn byte_converter(bytes: i64) -> String {
    if bytes <= 0 {
        return "0 B".to_string();
    }

    let mut unit_index = 0;
    while unit_index + 1 < BYTE_UNITS.len() && bytes >= 1i64 << (10 * (unit_index + 1)) {
        unit_index += 1;
    }

    let value = bytes as f64 / 1024f64.powi(unit_index as i32);
    format!("{} {}", trim_decimals(value), BYTE_UNITS[unit_index])
}

/// Round to two decimals and drop trailing zeros
fn trim_decimals(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Collapse the time since `past` to its single largest unit.
///
/// Units are counted in whole elapsed periods, so 23 hours is `"23 hour"`
/// rather than `"1 day"`. Timestamps in the future render as `"0 min"`.
pub fn format_age(past: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let months = whole_months_between(past, now);
    if months >= 12 {
        return format!("{} year", months / 12);
    }
    if months > 0 {
        return format!("{} month", months);
    }

    let elapsed = now.signed_duration_since(past);
    if elapsed.num_days() > 0 {
        return format!("{} day", elapsed.num_days());
    }
    if elapsed.num_hours() > 0 {
        return format!("{} hour", elapsed.num_hours());
    }
    format!("{} min", elapsed.num_minutes().max(0))
}

fn whole_months_between(past: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    if now <= past {
        return 0;
    }

    let mut months = (now.year() as i64 - past.year() as i64) * 12
        + (now.month() as i64 - past.month() as i64);

    // The last month only counts once its day and time of day are reached
    let past_in_month = (past.day(), past.num_seconds_from_midnight(), past.nanosecond());
    let now_in_month = (now.day(), now.num_seconds_from_midnight(), now.nanosecond());
    if now_in_month < past_in_month {
        months -= 1;
    }
    months.max(0)
}

/// Collapse a duration to the largest of seconds, minutes or hours.
///
/// Remainders are dropped, not carried: 125 seconds is `"2m"`.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}h", seconds / 3600)
    }
}
