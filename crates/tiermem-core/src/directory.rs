//! Metadata directory: one [`ContextKey`] record per stored item.
//!
//! Lookup is a linear scan in insertion order. Order matters: listing ties,
//! defragmentation, and persistence all follow it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};

/// Longest accepted key name, in bytes.
pub const MAX_KEY_NAME_LEN: usize = 63;
/// Default bound on the number of records.
pub const DEFAULT_MAX_CONTEXT_KEYS: usize = 1024;
/// Highest importance score.
pub const MAX_IMPORTANCE: u8 = 100;
/// Keys at or above this importance are exempt from expiry sweeps.
pub const EXPIRY_EXEMPT_IMPORTANCE: u8 = 80;
/// How far in the future a `last_accessed` stamp may be before it is invalid.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 3600;

/// Storage tier of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Working,
    Disk,
    Archived,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Working, Layer::Disk, Layer::Archived];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Disk => "disk",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "working" => Ok(Self::Working),
            "disk" => Ok(Self::Disk),
            "archived" => Ok(Self::Archived),
            other => Err(MemoryError::invalid(format!("unknown layer: {other}"))),
        }
    }
}

/// Metadata for one stored item.
///
/// Field names on disk follow `context_keys.json`:
/// `key`, `layer`, `importance_score`, `last_accessed` (unix seconds),
/// `data_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextKey {
    #[serde(rename = "key")]
    pub name: String,
    pub layer: Layer,
    #[serde(rename = "importance_score")]
    pub importance: u8,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_accessed: DateTime<Utc>,
    pub data_size: usize,
}

impl ContextKey {
    /// Structural checks applied before persisting and after loading.
    pub fn validate(&self, now: DateTime<Utc>) -> MemoryResult<()> {
        if self.name.is_empty() {
            return Err(MemoryError::Validation("key name is empty".into()));
        }
        if self.name.len() > MAX_KEY_NAME_LEN || self.name.contains('\0') {
            return Err(MemoryError::Validation(format!(
                "key name {:?} exceeds {MAX_KEY_NAME_LEN} bytes or contains NUL",
                self.name
            )));
        }
        if self.importance > MAX_IMPORTANCE {
            return Err(MemoryError::Validation(format!(
                "key {} has importance {} above {MAX_IMPORTANCE}",
                self.name, self.importance
            )));
        }
        if self.last_accessed > now + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS) {
            return Err(MemoryError::Validation(format!(
                "key {} was last accessed in the future ({})",
                self.name, self.last_accessed
            )));
        }
        Ok(())
    }

    /// Seconds since the key was last touched (never negative).
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_accessed).num_seconds().max(0)
    }
}

/// Check a caller-supplied key name.
///
/// Besides the length bound, names may not contain `<`, `>` or control
/// characters, since they are embedded in arena entry markers.
pub fn validate_key_name(name: &str) -> MemoryResult<()> {
    if name.is_empty() {
        return Err(MemoryError::invalid("key name is empty"));
    }
    if name.len() > MAX_KEY_NAME_LEN {
        return Err(MemoryError::invalid(format!(
            "key name is {} bytes, limit is {MAX_KEY_NAME_LEN}",
            name.len()
        )));
    }
    if name.chars().any(|c| c == '<' || c == '>' || c.is_control()) {
        return Err(MemoryError::invalid(format!(
            "key name {name:?} contains a reserved character"
        )));
    }
    Ok(())
}

pub(crate) fn check_importance(importance: u8) -> MemoryResult<()> {
    if importance > MAX_IMPORTANCE {
        return Err(MemoryError::invalid(format!(
            "importance {importance} is above {MAX_IMPORTANCE}"
        )));
    }
    Ok(())
}

/// Ordering used by [`KeyDirectory::list_by_layer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// Highest importance first.
    Importance,
    /// Most recently accessed first.
    Recency,
}

/// Bounded, insertion-ordered set of [`ContextKey`] records.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDirectory {
    keys: Vec<ContextKey>,
    max_keys: usize,
    exempt_importance: u8,
}

impl Default for KeyDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTEXT_KEYS)
    }
}

impl KeyDirectory {
    pub fn new(max_keys: usize) -> Self {
        Self {
            keys: Vec::new(),
            max_keys,
            exempt_importance: EXPIRY_EXEMPT_IMPORTANCE,
        }
    }

    /// Override the importance at which keys survive expiry sweeps.
    pub fn with_expiry_exemption(mut self, importance: u8) -> Self {
        self.exempt_importance = importance;
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= self.max_keys
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextKey> {
        self.keys.iter()
    }

    pub fn as_slice(&self) -> &[ContextKey] {
        &self.keys
    }

    /// Look up a key without touching it.
    pub fn get(&self, name: &str) -> Option<&ContextKey> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.keys.iter().position(|k| k.name == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> MemoryResult<&mut ContextKey> {
        self.keys
            .iter_mut()
            .find(|k| k.name == name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))
    }

    /// Register a new key with `last_accessed = now`.
    ///
    /// Checks run in a fixed order before anything is mutated: name,
    /// importance, duplicate, capacity.
    pub fn create(
        &mut self,
        name: &str,
        layer: Layer,
        importance: u8,
        data_size: usize,
        now: DateTime<Utc>,
    ) -> MemoryResult<&ContextKey> {
        validate_key_name(name)?;
        check_importance(importance)?;
        if self.contains(name) {
            return Err(MemoryError::AlreadyExists(name.to_string()));
        }
        if self.is_full() {
            return Err(MemoryError::CapacityExceeded(format!(
                "directory holds the maximum of {} keys",
                self.max_keys
            )));
        }
        self.keys.push(ContextKey {
            name: name.to_string(),
            layer,
            importance,
            last_accessed: now,
            data_size,
        });
        debug!(key = name, layer = %layer, importance, "context key created");
        Ok(&self.keys[self.keys.len() - 1])
    }

    /// Find a key and refresh its `last_accessed` stamp.
    ///
    /// Reads count as use: LRU-style policies downstream rely on it.
    pub fn find(&mut self, name: &str, now: DateTime<Utc>) -> MemoryResult<&ContextKey> {
        let key = self.get_mut(name)?;
        key.last_accessed = now;
        Ok(key)
    }

    pub fn update_importance(
        &mut self,
        name: &str,
        importance: u8,
        now: DateTime<Utc>,
    ) -> MemoryResult<()> {
        check_importance(importance)?;
        let key = self.get_mut(name)?;
        key.importance = importance;
        key.last_accessed = now;
        Ok(())
    }

    /// Reassign a key's layer. Metadata only: the caller owns the bytes.
    pub fn move_layer(&mut self, name: &str, target: Layer) -> MemoryResult<()> {
        let key = self.get_mut(name)?;
        if key.layer != target {
            debug!(key = name, from = %key.layer, to = %target, "layer reassigned");
            key.layer = target;
        }
        Ok(())
    }

    /// Mark a key archived. Does not compress or relocate bytes.
    pub fn archive(&mut self, name: &str) -> MemoryResult<()> {
        self.move_layer(name, Layer::Archived)
    }

    /// Remove a record, keeping the order of the remaining ones.
    pub fn remove(&mut self, name: &str) -> MemoryResult<ContextKey> {
        let idx = self
            .position(name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))?;
        Ok(self.keys.remove(idx))
    }

    /// Snapshot up to `max` keys of `layer` (0 = no limit), sorted
    /// descending by the requested order. Ties keep directory order.
    pub fn list_by_layer(&self, layer: Layer, max: usize, order: ListOrder) -> Vec<ContextKey> {
        let mut listed: Vec<ContextKey> =
            self.keys.iter().filter(|k| k.layer == layer).cloned().collect();
        match order {
            ListOrder::Importance => listed.sort_by(|a, b| b.importance.cmp(&a.importance)),
            ListOrder::Recency => listed.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed)),
        }
        if max > 0 {
            listed.truncate(max);
        }
        listed
    }

    /// Sweep keys idle for longer than `threshold_secs` whose importance is
    /// below the exemption level.
    ///
    /// Matching keys are re-tagged `Archived` when `archive` is set and
    /// removed otherwise. Returns the affected records as they were before
    /// the sweep.
    pub fn cleanup_expired(
        &mut self,
        threshold_secs: i64,
        archive: bool,
        now: DateTime<Utc>,
    ) -> MemoryResult<Vec<ContextKey>> {
        let expired = self.expired_keys(threshold_secs, now)?;
        for key in &expired {
            if archive {
                self.archive(&key.name)?;
            } else {
                self.remove(&key.name)?;
            }
        }
        Ok(expired)
    }

    /// Keys a sweep with `threshold_secs` would affect, in directory order.
    pub fn expired_keys(
        &self,
        threshold_secs: i64,
        now: DateTime<Utc>,
    ) -> MemoryResult<Vec<ContextKey>> {
        if threshold_secs <= 0 {
            return Err(MemoryError::invalid("expiry threshold must be positive"));
        }
        Ok(self
            .keys
            .iter()
            .filter(|k| {
                (now - k.last_accessed).num_seconds() > threshold_secs
                    && k.importance < self.exempt_importance
            })
            .cloned()
            .collect())
    }

    /// Rebuild from persisted records, skipping invalid or duplicate ones.
    pub(crate) fn from_records(
        records: Vec<ContextKey>,
        max_keys: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut dir = Self::new(max_keys);
        for record in records {
            if let Err(e) = record.validate(now) {
                tracing::warn!(key = %record.name, error = %e, "skipping invalid context key");
                continue;
            }
            if dir.contains(&record.name) {
                tracing::warn!(key = %record.name, "skipping duplicate context key");
                continue;
            }
            if dir.is_full() {
                tracing::warn!(key = %record.name, "directory full, dropping context key");
                continue;
            }
            dir.keys.push(record);
        }
        dir
    }
}
