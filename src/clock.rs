//! Time source and timestamp formatting.
//!
//! All stored timestamps use one fixed RFC 3339 shape (UTC, millisecond
//! precision, `Z` suffix) so that TEXT comparison in SQLite orders them
//! chronologically and a calendar day is a half-open string range.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_from_str(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a TEXT timestamp column inside a rusqlite row mapper.
pub fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    ts_from_str(idx, &raw)
}

pub fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| ts_from_str(idx, &raw)).transpose()
}

/// `[start, end)` bounds of a UTC calendar day in stored timestamp form.
pub fn day_bounds(date: NaiveDate) -> (String, String) {
    let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    let end = start + chrono::Duration::days(1);
    (format_ts(start), format_ts(end))
}
