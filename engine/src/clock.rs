//! Time source for validation records.

use std::fmt::Debug;

use chrono::prelude::*;

pub type Timestamp = DateTime<Utc>;

pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Reads the system's wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Always reports the same instant.
#[cfg(test)]
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub Timestamp);

#[cfg(test)]
impl FixedClock {
    /// Creates a clock stopped at the given number of seconds past the Unix epoch.
    pub fn at_unix_seconds(secs: i64) -> Self {
        Self(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}
