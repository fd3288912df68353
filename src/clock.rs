//! Wall-clock access, injectable so month boundaries can be pinned in tests.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// (year, month) of the current calendar month
    fn current_month(&self) -> (i32, u32) {
        let now = self.now();
        (now.year(), now.month())
    }

    /// (year, month) of the most recently closed calendar month
    fn previous_month(&self) -> (i32, u32) {
        let (year, month) = self.current_month();
        if month == 1 {
            (year - 1, 12)
        } else {
            (year, month - 1)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
