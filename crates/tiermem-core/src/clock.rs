//! Time source for key timestamps.
//!
//! All recency logic (expiry sweeps, relevance buckets, preserve-recent
//! paging) reads time through a [`Clock`] so tests can age keys without
//! sleeping.

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current wall-clock time.
///
/// Timestamps are whole seconds, matching the on-disk representation.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

/// A manually driven clock. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    secs: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start at the given instant (sub-second part is dropped).
    #[must_use]
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            secs: Arc::new(AtomicI64::new(start.timestamp())),
        }
    }

    /// Start at the current system time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::at(Utc::now())
    }

    pub fn set(&self, when: DateTime<Utc>) {
        self.secs.store(when.timestamp(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.num_seconds(), Ordering::SeqCst);
    }

    pub fn rewind(&self, by: Duration) {
        self.secs.fetch_sub(by.num_seconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.secs.load(Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_shared_time() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let other = clock.clone();
        clock.advance(Duration::hours(2));
        assert_eq!(
            other.now(),
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()
        );
        other.rewind(Duration::minutes(30));
        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 30, 0).unwrap()
        );
    }

    #[test]
    fn system_clock_has_whole_seconds() {
        assert_eq!(SystemClock.now().timestamp_subsec_nanos(), 0);
    }
}
