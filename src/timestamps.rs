//! Timestamp parsing and signed day distances.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

pub const SECONDS_PER_DAY: f64 = 86_400.0;

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parses the timestamp texts found in episode lists and event tables.
///
/// Date-only values land on midnight; RFC 3339 values are converted to UTC
/// and stripped of their offset.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(ts);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|ts| ts.naive_utc())
}

pub fn days_between(anchor: NaiveDateTime, ts: NaiveDateTime) -> f64 {
    let delta = ts - anchor;
    let seconds = delta.num_seconds() as f64
        + f64::from(delta.subsec_nanos()) / 1_000_000_000.0;
    seconds / SECONDS_PER_DAY
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
