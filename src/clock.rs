//! Wall clock access.
//!
//! Timestamps throughout the crate are milliseconds since the Unix epoch.
//! The monitor reads time only through [`Clock`] so tests can drive it.

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

/// Convert an epoch-millisecond timestamp into a UTC date-time.
pub fn to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// ISO-8601 rendering used in exports, empty when out of range.
pub fn to_iso(ms: i64) -> String {
    to_utc(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Local time rendering used for default session names.
pub fn to_local_display(ms: i64) -> String {
    to_utc(ms)
        .map(|dt| {
            dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
        })
        .unwrap_or_default()
}
