//! Storage hygiene: expiry deletion, near-duplicate removal, orphan
//! purging, archive recompression and layer rebalancing.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directory::{ContextKey, Layer};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::{TaggedMemory, AGGRESSIVE_COMPACT_THRESHOLD_SECS, COMPACT_THRESHOLD_SECS};

const DUPLICATE_SIMILARITY: f64 = 0.95;
const AGGRESSIVE_DUPLICATE_SIMILARITY: f64 = 0.8;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86_400;
const WEEK_SECS: i64 = 7 * DAY_SECS;

/// Target share of keys per layer used by [`TaggedMemory::layer_imbalance`].
const IDEAL_LAYER_SHARE: [(Layer, f64); 3] = [
    (Layer::Working, 0.3),
    (Layer::Disk, 0.5),
    (Layer::Archived, 0.2),
];

/// Per-step counts from [`TaggedMemory::optimize_storage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageReport {
    pub expired: usize,
    pub duplicates: usize,
    pub orphaned: usize,
    pub rebalanced: usize,
    pub recompressed: usize,
}

/// Rough similarity of two strings in `[0.0, 1.0]`.
///
/// Identical strings score 1.0 and containment scores 0.8. Otherwise the
/// score is the shared prefix length over the longer length.
pub fn content_similarity(a: &str, b: &str) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    if a == b {
        return 1.0;
    }
    if a.contains(b) || b.contains(a) {
        return 0.8;
    }
    let prefix = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    let longest = a.chars().count().max(b.chars().count());
    prefix as f64 / longest as f64
}

/// Which of two near-duplicates loses: lower importance, then older.
fn loser<'a>(a: &'a ContextKey, b: &'a ContextKey) -> &'a ContextKey {
    if b.importance > a.importance
        || (b.importance == a.importance && b.last_accessed > a.last_accessed)
    {
        a
    } else {
        b
    }
}

impl TaggedMemory {
    /// Delete (not archive) keys idle longer than `threshold_secs`, sparing
    /// exempt importance. Returns the number deleted.
    pub fn cleanup_expired_entries(&mut self, threshold_secs: i64) -> MemoryResult<usize> {
        self.cleanup_expired(threshold_secs, false)
    }

    /// Remove keys whose name and value are both at least `similarity`
    /// alike to another key's, keeping the more important (then more
    /// recently used) one. Returns the number removed.
    pub fn cleanup_duplicates(&mut self, similarity: f64) -> MemoryResult<usize> {
        if !(0.0..=1.0).contains(&similarity) {
            return Err(MemoryError::invalid(format!(
                "similarity {similarity} outside 0.0..=1.0"
            )));
        }
        let readable: Vec<(ContextKey, String)> = self
            .keys()
            .iter()
            .filter_map(|k| self.peek(&k.name).ok().map(|data| (k.clone(), data)))
            .collect();

        let mut doomed: Vec<String> = Vec::new();
        for (i, (a, a_data)) in readable.iter().enumerate() {
            if doomed.contains(&a.name) {
                continue;
            }
            for (b, b_data) in &readable[i + 1..] {
                if doomed.contains(&b.name) {
                    continue;
                }
                if content_similarity(&a.name, &b.name) < similarity
                    || content_similarity(a_data, b_data) < similarity
                {
                    continue;
                }
                let drop = loser(a, b);
                debug!(dropped = %drop.name, "near-duplicate key");
                doomed.push(drop.name.clone());
                if drop.name == a.name {
                    break;
                }
            }
        }

        let mut removed = 0;
        for name in doomed {
            match self.delete(&name) {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %name, error = %e, "duplicate cleanup skipped key"),
            }
        }
        if removed > 0 {
            info!(event = "duplicates_removed", removed, similarity);
        }
        Ok(removed)
    }

    /// Drop records whose bytes are missing or unreadable. Returns the
    /// number dropped.
    pub fn cleanup_orphaned(&mut self) -> MemoryResult<usize> {
        let orphans: Vec<String> = self
            .keys()
            .iter()
            .filter(|k| self.peek(&k.name).is_err())
            .map(|k| k.name.clone())
            .collect();
        let mut dropped = 0;
        for name in &orphans {
            if self.forget(name)? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(event = "orphans_dropped", dropped);
        }
        Ok(dropped)
    }

    /// Run every archived entry through the compressor again. Returns the
    /// number of entries that changed.
    pub fn compress_archives(&mut self) -> MemoryResult<usize> {
        let compressor = self.compressor();
        let archived: Vec<String> = self
            .keys()
            .iter()
            .filter(|k| k.layer == Layer::Archived)
            .map(|k| k.name.clone())
            .collect();
        let mut changed = 0;
        for name in archived {
            let data = match self.peek(&name) {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %name, error = %e, "archive recompression skipped key");
                    continue;
                }
            };
            let compressed = compressor.compress(&data);
            if compressed != data {
                self.rewrite(&name, &compressed)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Move keys toward the layer their importance and recency call for.
    ///
    /// Important keys used in the last hour go to working memory. Keys at
    /// 20 or below idle over a week are archived. Working keys at 40 or
    /// below idle over a day drop to disk. Returns the number moved.
    pub fn rebalance_layers(&mut self) -> MemoryResult<usize> {
        let now = self.now();
        let exempt = self.config().expiry_exemption_importance;
        let moves: Vec<(String, Layer)> = self
            .keys()
            .iter()
            .filter_map(|k| {
                let age = k.age_secs(now);
                let target = if k.importance >= exempt && age < HOUR_SECS {
                    Layer::Working
                } else if k.importance <= 20 && age > WEEK_SECS {
                    Layer::Archived
                } else if k.importance <= 40 && age > DAY_SECS && k.layer == Layer::Working {
                    Layer::Disk
                } else {
                    return None;
                };
                (k.layer != target).then(|| (k.name.clone(), target))
            })
            .collect();

        let mut moved = 0;
        for (name, target) in moves {
            match self.relocate(&name, target) {
                Ok(()) => moved += 1,
                Err(e) => warn!(key = %name, error = %e, "rebalance skipped key"),
            }
        }
        Ok(moved)
    }

    /// How far the key distribution is from 30% working, 50% disk and
    /// 20% archived. 0.0 is ideal; larger is worse.
    pub fn layer_imbalance(&self) -> f64 {
        let total = self.keys().len();
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = IDEAL_LAYER_SHARE
            .iter()
            .map(|&(layer, share)| {
                let ideal = total as f64 * share;
                let actual = self.keys().iter().filter(|k| k.layer == layer).count() as f64;
                (actual - ideal).abs() / ideal
            })
            .sum();
        sum / IDEAL_LAYER_SHARE.len() as f64
    }

    /// Expired deletion, duplicate removal and orphan purging; the
    /// aggressive pass uses tighter thresholds and also rebalances layers
    /// and recompresses archives.
    pub fn optimize_storage(&mut self, aggressive: bool) -> MemoryResult<StorageReport> {
        let (threshold, similarity) = if aggressive {
            (AGGRESSIVE_COMPACT_THRESHOLD_SECS, AGGRESSIVE_DUPLICATE_SIMILARITY)
        } else {
            (COMPACT_THRESHOLD_SECS, DUPLICATE_SIMILARITY)
        };
        let mut report = StorageReport {
            expired: self.cleanup_expired_entries(threshold)?,
            duplicates: self.cleanup_duplicates(similarity)?,
            orphaned: self.cleanup_orphaned()?,
            ..StorageReport::default()
        };
        if aggressive {
            report.rebalanced = self.rebalance_layers()?;
            report.recompressed = self.compress_archives()?;
        }
        info!(event = "storage_optimized", aggressive, report = ?report);
        Ok(report)
    }
}
