//! Injectable clock: production code reads the wall clock, tests advance
//! a mock clock manually so integration scenarios can drive exact
//! timestamps.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time, injected into every component that
/// stamps entities or computes backoff.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-advanced clock used by integration scenario tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.inner.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock();
        *guard += chrono::Duration::from_std(by).expect("duration fits in chrono::Duration");
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }
}

/// Render a timestamp the way every key in this crate is rendered: RFC
/// 3339, millisecond precision, `Z` suffix, lexicographically sortable.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_ts(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::error::Error::BadRequest(format!("invalid timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trips() {
        let t = Utc::now();
        let s = format_ts(t);
        let back = parse_ts(&s).unwrap();
        // millisecond precision, so compare formatted strings rather than exact instants
        assert_eq!(format_ts(back), s);
    }

    #[test]
    fn mock_clock_advances() {
        let start: DateTime<Utc> = "2000-01-01T00:00:00.000Z".parse().unwrap();
        let clock = MockClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(format_ts(clock.now()), "2000-01-01T01:00:00.000Z");
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = format_ts("2000-01-01T02:00:00.000Z".parse::<DateTime<Utc>>().unwrap());
        let b = format_ts("2000-01-01T02:00:00.001Z".parse::<DateTime<Utc>>().unwrap());
        assert!(a < b);
    }
}
