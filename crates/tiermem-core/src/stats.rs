//! Running counters for a memory instance.
//!
//! Counters are bumped silently at the call site. Call
//! [`MemoryStats::flush`] to emit a snapshot as a single `tracing::info!`
//! event at a natural boundary (shutdown, after compaction, ...).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Per-instance operation counters and access-latency average.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    access_count: u64,
    store_count: u64,
    delete_count: u64,
    avg_access_time_us: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl Counters {
    /// Record one retrieve and fold its latency into the moving average.
    ///
    /// The first sample seeds the average; later ones weigh 1/10.
    pub(crate) fn record_access(&mut self, elapsed: Duration) {
        let sample = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.avg_access_time_us = if self.access_count == 0 {
            sample
        } else {
            (self.avg_access_time_us.saturating_mul(9).saturating_add(sample)) / 10
        };
        self.access_count += 1;
        tracing::trace!(metric = "access_count", "counter incremented");
    }

    pub(crate) fn record_store(&mut self, now: DateTime<Utc>) {
        self.store_count += 1;
        self.last_modified = Some(now);
        tracing::trace!(metric = "store_count", "counter incremented");
    }

    pub(crate) fn record_delete(&mut self, now: DateTime<Utc>) {
        self.delete_count += 1;
        self.last_modified = Some(now);
        tracing::trace!(metric = "delete_count", "counter incremented");
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified = Some(now);
    }
}

/// Point-in-time snapshot returned by [`TaggedMemory::stats`](crate::TaggedMemory::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_size: usize,
    pub working_size: usize,
    pub disk_size: usize,
    pub archived_size: usize,
    pub key_count: usize,
    pub access_count: u64,
    pub store_count: u64,
    pub delete_count: u64,
    pub avg_access_time_us: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl MemoryStats {
    pub(crate) fn from_parts(
        counters: &Counters,
        sizes: [usize; 3],
        key_count: usize,
    ) -> Self {
        let [working_size, disk_size, archived_size] = sizes;
        Self {
            total_size: working_size + disk_size + archived_size,
            working_size,
            disk_size,
            archived_size,
            key_count,
            access_count: counters.access_count,
            store_count: counters.store_count,
            delete_count: counters.delete_count,
            avg_access_time_us: counters.avg_access_time_us,
            last_modified: counters.last_modified,
        }
    }

    /// Emit the snapshot as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            total_size = self.total_size,
            working_size = self.working_size,
            disk_size = self.disk_size,
            archived_size = self.archived_size,
            key_count = self.key_count,
            access_count = self.access_count,
            store_count = self.store_count,
            delete_count = self.delete_count,
            avg_access_time_us = self.avg_access_time_us,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_average() {
        let mut c = Counters::default();
        c.record_access(Duration::from_micros(500));
        assert_eq!(c.avg_access_time_us, 500);
        c.record_access(Duration::from_micros(1500));
        assert_eq!(c.avg_access_time_us, (9 * 500 + 1500) / 10);
        assert_eq!(c.access_count, 2);
    }

    #[test]
    fn snapshot_sums_layer_sizes() {
        let mut c = Counters::default();
        let now = Utc::now();
        c.record_store(now);
        c.record_store(now);
        c.record_delete(now);
        let stats = MemoryStats::from_parts(&c, [10, 20, 5], 2);
        assert_eq!(stats.total_size, 35);
        assert_eq!(stats.store_count, 2);
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.last_modified, Some(now));
        stats.flush();
    }
}
