use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDateTime, TimeDelta};

/// Source of "now" for policy checks. All times are local wall-clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self {
            millis: AtomicI64::new(at.and_utc().timestamp_millis()),
        }
    }

    pub fn set(&self, at: NaiveDateTime) {
        self.millis
            .store(at.and_utc().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: TimeDelta) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .map(|dt| dt.naive_utc())
            .unwrap_or(NaiveDateTime::MIN)
    }
}
