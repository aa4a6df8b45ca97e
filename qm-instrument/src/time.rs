use chrono::{DateTime, NaiveDate, Utc};

/// UTC timestamp with sub-millisecond precision (spec.md §3 `Instant`).
///
/// `chrono::DateTime<Utc>` already carries nanosecond precision internally;
/// callers that ingest epoch-millis timestamps (the wire protocol in §6)
/// construct this via [`from_epoch_millis`].
pub type Instant = DateTime<Utc>;

/// Calendar date in UTC (spec.md §3 `SessionDate`), used to key
/// per-(symbol,date) completeness and report state.
pub type SessionDate = NaiveDate;

pub fn from_epoch_millis(ms: i64) -> Instant {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| DateTime::from_timestamp_nanos(0))
}

pub fn to_epoch_millis(instant: Instant) -> i64 {
    instant.timestamp_millis()
}

/// Current wall-clock time, used by periodic sweeps (spec.md §9
/// "Timer-driven periodic sweeps"). Centralised here so every crate reaches
/// for the same clock rather than calling `chrono::Utc::now()` directly.
pub fn now() -> Instant {
    Utc::now()
}
