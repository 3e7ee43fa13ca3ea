use crate::error::Error;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sentinel start date used to materialize a table schema without data.
pub const EPOCH_DATE: &str = "1970-01-01";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

pub fn lookback_date(date: NaiveDate, days: i64) -> NaiveDate {
    date - Duration::days(days)
}

pub fn lookforward_date(date: NaiveDate, days: i64) -> NaiveDate {
    date + Duration::days(days)
}

/// Every date from `start` (inclusive) to `end` (exclusive).
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d < end)
        .collect()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, Error> {
    NaiveDate::parse_from_str(s, DEFAULT_DATE_FORMAT).map_err(|_| Error::InvalidDate {
        date: s.to_string(),
    })
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DEFAULT_DATE_FORMAT).to_string()
}

/// Parses the timestamp shapes partner payloads use. Offsets are dropped
/// after converting to UTC; bare dates become midnight.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, DEFAULT_DATE_FORMAT)
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Dash-delimited form accepted by the warehouse loader.
pub fn format_timestamp(dt: NaiveDateTime) -> String {
    dt.format(DEFAULT_DATETIME_FORMAT).to_string()
}
