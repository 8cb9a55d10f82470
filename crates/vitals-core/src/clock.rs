//! Logical microsecond clock.
//!
//! Event times are microsecond ticks. [`SystemClock`] never hands out the same
//! tick twice within a process, so tick-keyed records (commits, builds) stay
//! distinct even when calls land in the same wall-clock microsecond.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microseconds per hour.
pub const MICROS_PER_HOUR: i64 = 3_600 * MICROS_PER_SECOND;

/// A point on the logical clock, in microseconds since the Unix epoch.
///
/// [`Timestamp::ZERO`] means "never".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The zero timestamp ("never").
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from raw microseconds.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns the raw microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns true for the zero ("never") timestamp.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns this timestamp moved `secs` seconds into the past.
    #[must_use]
    pub fn minus_secs(self, secs: u64) -> Self {
        let delta = i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SECOND);
        Self(self.0.saturating_sub(delta))
    }

    /// Converts to a wall-clock time, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }

    /// Formats the time elapsed between `self` and `now` as `"{days}d {hours}h"`.
    ///
    /// Returns `"never"` for the zero timestamp.
    #[must_use]
    pub fn elapsed_since(self, now: Self) -> String {
        if self.is_zero() {
            return "never".to_string();
        }
        let hours = now.0.saturating_sub(self.0).max(0) / MICROS_PER_HOUR;
        format!("{}d {}h", hours / 24, hours % 24)
    }

    /// Formats the timestamp as an RFC 3339 date, or `"never"`.
    #[must_use]
    pub fn date_string(self) -> String {
        if self.is_zero() {
            return "never".to_string();
        }
        self.to_datetime()
            .map_or_else(|| self.0.to_string(), |dt| dt.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of event timestamps.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current tick.
    fn now(&self) -> Timestamp;
}

/// Wall-clock backed, strictly monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    /// Creates a new system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start.as_micros()),
        }
    }

    /// Moves the clock to `at`.
    pub fn set(&self, at: Timestamp) {
        self.now.store(at.as_micros(), Ordering::SeqCst);
    }

    /// Advances the clock by `micros`.
    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}
