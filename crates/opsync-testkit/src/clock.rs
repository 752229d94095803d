//! Deterministic clock for scenario tests (spec §9: clock injection is
//! mandatory so backoff, breaker cooldown, and lock TTL tests never sleep a
//! wall-clock second).

use chrono::{DateTime, Duration, Utc};
use opsync_engine::Clock;
use std::sync::Mutex;

pub struct FakeClock(Mutex<DateTime<Utc>>);

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn epoch() -> Self {
        Self::new(DateTime::UNIX_EPOCH)
    }

    pub fn advance(&self, by: Duration) {
        let mut t = self.0.lock().unwrap();
        *t += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
