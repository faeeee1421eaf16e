use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::models::RawDuration;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// RFC 3339, or a zone-less date-time read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// A timestamp, or a bare `YYYY-MM-DD` read as the start of that UTC day.
pub fn parse_range_start(value: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(value).or_else(|| parse_day(value, NaiveTime::MIN))
}

/// A timestamp, or a bare `YYYY-MM-DD` read as the last second of that UTC day.
pub fn parse_range_end(value: &str) -> Option<DateTime<Utc>> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59)?;
    parse_timestamp(value).or_else(|| parse_day(value, last_second))
}

fn parse_day(value: &str, time: NaiveTime) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .map(|day| day.and_time(time).and_utc())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Whole minutes; seconds are truncated, negative values are dropped.
pub fn duration_minutes(duration: Option<RawDuration>) -> Option<i32> {
    let minutes = match duration? {
        RawDuration::Seconds(seconds) => seconds / 60,
        RawDuration::Minutes(minutes) => minutes,
    };
    if minutes < 0 {
        return None;
    }
    i32::try_from(minutes).ok()
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
