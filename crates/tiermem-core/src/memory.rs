//! The [`TaggedMemory`] aggregate: key directory plus one arena per layer.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::arena::{check_payload, Arena};
use crate::buffer::{Buffer, MAX_BUFFER_CAPACITY};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryConfig;
use crate::directory::{
    check_importance, validate_key_name, ContextKey, KeyDirectory, Layer, ListOrder,
};
use crate::error::{MemoryError, MemoryResult};
use crate::paging::compress::{Compressor, WhitespaceCollapse};
use crate::persist;
use crate::stats::{Counters, MemoryStats};

/// Expiry threshold for a normal [`TaggedMemory::compact`] pass, in seconds.
pub const COMPACT_THRESHOLD_SECS: i64 = 30 * 86_400;
/// Expiry threshold for an aggressive [`TaggedMemory::compact`] pass, in seconds.
pub const AGGRESSIVE_COMPACT_THRESHOLD_SECS: i64 = 7 * 86_400;

fn slot(layer: Layer) -> usize {
    match layer {
        Layer::Working => 0,
        Layer::Disk => 1,
        Layer::Archived => 2,
    }
}

/// Tiered tagged memory for a single agent.
///
/// Every key lives in exactly one layer and its bytes live in that layer's
/// arena. The aggregate has no internal locking; wrap it in
/// [`SharedMemory`](crate::SharedMemory) to share it between tasks.
#[derive(Debug)]
pub struct TaggedMemory {
    pub(crate) directory: KeyDirectory,
    arenas: [Arena; 3],
    counters: Counters,
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    compressor: Arc<dyn Compressor>,
}

impl TaggedMemory {
    /// Empty, in-memory instance. Nothing touches disk until [`save`](Self::save).
    pub fn new(config: MemoryConfig) -> Self {
        let directory = KeyDirectory::new(config.max_context_keys)
            .with_expiry_exemption(config.expiry_exemption_importance);
        Self {
            directory,
            arenas: Default::default(),
            counters: Counters::default(),
            config,
            clock: Arc::new(SystemClock),
            compressor: Arc::new(WhitespaceCollapse),
        }
    }

    /// Load an instance from the files named in `config`.
    ///
    /// Missing files mean an empty memory; when neither file exists both
    /// are created empty.
    pub fn open(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let mut memory = Self::new(config);
        memory.reload()?;
        Ok(memory)
    }

    /// Replace in-memory state with what is on disk.
    pub fn reload(&mut self) -> MemoryResult<()> {
        let memory_file = &self.config.memory_file;
        let keys_file = &self.config.context_keys_file;
        if !memory_file.exists() && !keys_file.exists() {
            persist::initialize(memory_file, keys_file)?;
        }
        let arenas = persist::load_memory(memory_file)?;
        let directory = persist::load_context_keys(
            keys_file,
            self.config.max_context_keys,
            self.clock.now(),
        )?
        .with_expiry_exemption(self.config.expiry_exemption_importance);

        self.arenas = [
            Arena::from_bytes(arenas.working.as_bytes())?,
            Arena::from_bytes(arenas.disk.as_bytes())?,
            Arena::from_bytes(arenas.archived.as_bytes())?,
        ];
        self.directory = directory;
        self.adopt_archived_bytes()?;
        info!(
            event = "memory_loaded",
            keys = self.directory.len(),
            working_size = self.arenas[0].len(),
            disk_size = self.arenas[1].len(),
            archived_size = self.arenas[2].len(),
        );
        Ok(())
    }

    /// Move archived keys whose bytes sit in the disk arena into the
    /// archived arena.
    ///
    /// Files written without an `archived_memory` field kept archived
    /// bytes alongside disk bytes. Returns the number of keys moved.
    fn adopt_archived_bytes(&mut self) -> MemoryResult<usize> {
        let stranded: Vec<String> = self
            .directory
            .iter()
            .filter(|k| k.layer == Layer::Archived)
            .map(|k| k.name.clone())
            .collect();
        let mut adopted = 0;
        for name in stranded {
            if self.arenas[slot(Layer::Archived)].read_entry(&name)?.is_some() {
                continue;
            }
            let Some(bytes) = self.arenas[slot(Layer::Disk)].read_entry(&name)? else {
                continue;
            };
            self.arenas[slot(Layer::Disk)].remove_entry(&name)?;
            self.arenas[slot(Layer::Archived)].append_entry(&name, &bytes)?;
            adopted += 1;
        }
        if adopted > 0 {
            warn!(adopted, "archived keys found in disk arena, moved to archived arena");
        }
        Ok(adopted)
    }

    /// Use a different time source (tests drive a [`ManualClock`](crate::ManualClock)).
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn compressor(&self) -> Arc<dyn Compressor> {
        Arc::clone(&self.compressor)
    }

    /// The metadata directory, read-only.
    pub fn keys(&self) -> &KeyDirectory {
        &self.directory
    }

    /// Look up a key without refreshing its recency.
    pub fn key(&self, name: &str) -> Option<&ContextKey> {
        self.directory.get(name)
    }

    pub fn arena(&self, layer: Layer) -> &Arena {
        &self.arenas[slot(layer)]
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats::from_parts(
            &self.counters,
            [
                self.arenas[0].len(),
                self.arenas[1].len(),
                self.arenas[2].len(),
            ],
            self.directory.len(),
        )
    }

    fn ensure_fits(&self, layer: Layer, name: &str, data_len: usize) -> MemoryResult<()> {
        let framed = data_len + name.len() + 16;
        if self.arenas[slot(layer)].len() + framed >= MAX_BUFFER_CAPACITY {
            return Err(MemoryError::CapacityExceeded(format!(
                "{layer} arena cannot hold {data_len} more bytes"
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // store / retrieve / delete
    // ---------------------------------------------------------------------

    /// Create or overwrite `name` in `layer`.
    ///
    /// Overwriting excises the previous entry from whichever arena held it
    /// before the new one is appended, so a key never has two entries.
    pub fn store(&mut self, name: &str, data: &str, layer: Layer, importance: u8) -> MemoryResult<()> {
        validate_key_name(name)?;
        check_importance(importance)?;
        check_payload(data.as_bytes())?;
        self.ensure_fits(layer, name, data.len())?;
        let now = self.clock.now();

        let previous = match self.directory.get(name).cloned() {
            Some(old) => {
                let bytes = self.arenas[slot(old.layer)].read_entry(name)?;
                for arena in &mut self.arenas {
                    arena.remove_all(name)?;
                }
                let key = self.directory.get_mut(name)?;
                key.layer = layer;
                key.importance = importance;
                key.data_size = data.len();
                key.last_accessed = now;
                Some((old, bytes))
            }
            None => {
                self.directory
                    .create(name, layer, importance, data.len(), now)?;
                None
            }
        };

        if let Err(e) = self.arenas[slot(layer)].append_entry(name, data.as_bytes()) {
            self.undo_store(name, previous);
            return Err(e);
        }
        self.counters.record_store(now);
        debug!(key = name, layer = %layer, importance, size = data.len(), "stored");
        Ok(())
    }

    /// Put `name` back the way it was before a failed [`store`](Self::store):
    /// the old record and bytes when it existed, nothing when it did not.
    fn undo_store(&mut self, name: &str, previous: Option<(ContextKey, Option<Vec<u8>>)>) {
        for arena in &mut self.arenas {
            arena.remove_all(name).ok();
        }
        match previous {
            None => {
                self.directory.remove(name).ok();
            }
            Some((old, bytes)) => {
                if let Some(bytes) = bytes {
                    if let Err(e) = self.arenas[slot(old.layer)].append_entry(name, &bytes) {
                        warn!(key = name, error = %e, "could not restore previous entry");
                    }
                }
                if let Ok(key) = self.directory.get_mut(name) {
                    *key = old;
                }
            }
        }
    }

    /// Read the value of `name`, refreshing its recency.
    pub fn retrieve(&mut self, name: &str) -> MemoryResult<String> {
        let started = Instant::now();
        let now = self.clock.now();
        let layer = self.directory.find(name, now)?.layer;
        let data = self.read_from(layer, name)?;
        self.counters.record_access(started.elapsed());
        Ok(data)
    }

    /// [`retrieve`](Self::retrieve) into a caller-owned buffer.
    pub fn retrieve_into(&mut self, name: &str, out: &mut Buffer) -> MemoryResult<()> {
        let data = self.retrieve(name)?;
        out.set(data.as_bytes(), 0)
    }

    /// Read bytes without counting an access.
    pub(crate) fn peek(&self, name: &str) -> MemoryResult<String> {
        let layer = self
            .directory
            .get(name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))?
            .layer;
        self.read_from(layer, name)
    }

    fn read_from(&self, layer: Layer, name: &str) -> MemoryResult<String> {
        let bytes = self.arenas[slot(layer)]
            .read_entry(name)?
            .ok_or_else(|| MemoryError::corrupt(name, format!("no entry in {layer} arena")))?;
        String::from_utf8(bytes).map_err(|_| MemoryError::corrupt(name, "entry is not UTF-8"))
    }

    /// Remove `name` and its bytes.
    ///
    /// A key whose bytes are missing from its arena yields `CorruptEntry`
    /// and is left in place; see [`forget`](Self::forget).
    pub fn delete(&mut self, name: &str) -> MemoryResult<()> {
        let layer = self
            .directory
            .get(name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))?
            .layer;
        if self.arenas[slot(layer)].remove_entry(name)?.is_none() {
            return Err(MemoryError::corrupt(name, format!("no entry in {layer} arena")));
        }
        self.directory.remove(name)?;
        self.counters.record_delete(self.clock.now());
        debug!(key = name, layer = %layer, "deleted");
        Ok(())
    }

    /// Drop a key's record and any bytes under its name, without
    /// consistency checks. Returns whether a record existed.
    pub fn forget(&mut self, name: &str) -> MemoryResult<bool> {
        for arena in &mut self.arenas {
            arena.remove_all(name)?;
        }
        let existed = self.directory.remove(name).is_ok();
        if existed {
            self.counters.record_delete(self.clock.now());
        }
        Ok(existed)
    }

    // ---------------------------------------------------------------------
    // metadata operations
    // ---------------------------------------------------------------------

    /// Register a key with no stored bytes.
    pub fn create_key(
        &mut self,
        name: &str,
        layer: Layer,
        importance: u8,
        data_size: usize,
    ) -> MemoryResult<ContextKey> {
        let now = self.clock.now();
        self.directory
            .create(name, layer, importance, data_size, now)
            .cloned()
    }

    /// Look up a key, refreshing its recency.
    pub fn find_key(&mut self, name: &str) -> MemoryResult<ContextKey> {
        let now = self.clock.now();
        self.directory.find(name, now).cloned()
    }

    pub fn update_importance(&mut self, name: &str, importance: u8) -> MemoryResult<()> {
        let now = self.clock.now();
        self.directory.update_importance(name, importance, now)
    }

    /// Reassign a key's layer **without** moving its bytes.
    ///
    /// After this call `retrieve` looks in the new layer's arena and fails
    /// with `CorruptEntry` until the bytes follow. Use
    /// [`relocate`](Self::relocate) to move both together.
    pub fn move_layer(&mut self, name: &str, target: Layer) -> MemoryResult<()> {
        self.directory.move_layer(name, target)
    }

    /// Tag a key archived. Metadata only, like [`move_layer`](Self::move_layer).
    pub fn archive_key(&mut self, name: &str) -> MemoryResult<()> {
        self.directory.archive(name)
    }

    pub fn list_by_layer(&self, layer: Layer, max: usize, order: ListOrder) -> Vec<ContextKey> {
        self.directory.list_by_layer(layer, max, order)
    }

    /// Move a key's bytes into `target`'s arena and update its layer.
    ///
    /// Recency is not refreshed: paging is not an access.
    pub fn relocate(&mut self, name: &str, target: Layer) -> MemoryResult<()> {
        let from = self
            .directory
            .get(name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))?
            .layer;
        if from == target {
            return Ok(());
        }
        let data = self.read_from(from, name)?;
        self.ensure_fits(target, name, data.len())?;
        self.arenas[slot(from)].remove_entry(name)?;
        self.arenas[slot(target)].append_entry(name, data.as_bytes())?;
        self.directory.move_layer(name, target)?;
        self.counters.touch(self.clock.now());
        debug!(key = name, from = %from, to = %target, "relocated");
        Ok(())
    }

    /// Replace a key's bytes in place, keeping its layer, importance and
    /// recency.
    pub(crate) fn rewrite(&mut self, name: &str, data: &str) -> MemoryResult<()> {
        check_payload(data.as_bytes())?;
        let layer = self
            .directory
            .get(name)
            .ok_or_else(|| MemoryError::not_found(format!("key {name}")))?
            .layer;
        self.ensure_fits(layer, name, data.len())?;
        let arena = &mut self.arenas[slot(layer)];
        if arena.remove_entry(name)?.is_none() {
            return Err(MemoryError::corrupt(name, format!("no entry in {layer} arena")));
        }
        arena.append_entry(name, data.as_bytes())?;
        self.directory.get_mut(name)?.data_size = data.len();
        self.counters.touch(self.clock.now());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------

    /// Sweep keys idle longer than `threshold_secs` with importance below
    /// the exemption level, archiving (bytes included) or deleting them.
    ///
    /// Best-effort: a key that fails is logged and skipped. Returns the
    /// number of keys affected.
    pub fn cleanup_expired(&mut self, threshold_secs: i64, archive: bool) -> MemoryResult<usize> {
        let expired = self.directory.expired_keys(threshold_secs, self.clock.now())?;
        let mut affected = 0;
        for key in expired {
            let outcome = if archive {
                self.relocate(&key.name, Layer::Archived)
            } else {
                self.delete(&key.name)
            };
            match outcome {
                Ok(()) => affected += 1,
                Err(e) => warn!(key = %key.name, error = %e, "expiry sweep skipped key"),
            }
        }
        if affected > 0 {
            info!(event = "expired_keys_swept", affected, archive, threshold_secs);
        }
        Ok(affected)
    }

    /// Archive keys idle for 30 days (7 when `aggressive`).
    pub fn compact(&mut self, aggressive: bool) -> MemoryResult<usize> {
        let threshold = if aggressive {
            AGGRESSIVE_COMPACT_THRESHOLD_SECS
        } else {
            COMPACT_THRESHOLD_SECS
        };
        self.cleanup_expired(threshold, true)
    }

    /// Rebuild every arena from the directory, in directory order.
    ///
    /// Drops stray bytes that no record points at. Records whose bytes are
    /// missing are kept and logged. Returns the number of bytes reclaimed.
    pub fn defragment(&mut self) -> MemoryResult<usize> {
        let before = self.stats().total_size;
        let mut rebuilt: [Arena; 3] = Default::default();
        for key in self.directory.iter() {
            match self.arenas[slot(key.layer)].read_entry(&key.name) {
                Ok(Some(bytes)) => {
                    rebuilt[slot(key.layer)].append_entry(&key.name, &bytes)?;
                }
                Ok(None) => warn!(key = %key.name, layer = %key.layer, "defragment: missing bytes"),
                Err(e) => warn!(key = %key.name, error = %e, "defragment: unreadable entry"),
            }
        }
        self.arenas = rebuilt;
        let after = self.stats().total_size;
        self.counters.touch(self.clock.now());
        info!(event = "defragmented", before, after);
        Ok(before.saturating_sub(after))
    }

    /// Persist arenas and directory to the configured files.
    pub fn save(&self) -> MemoryResult<()> {
        persist::save_memory(
            &self.config.memory_file,
            &self.arenas[0].as_str(),
            &self.arenas[1].as_str(),
            &self.arenas[2].as_str(),
        )?;
        persist::save_context_keys(
            &self.config.context_keys_file,
            &self.directory,
            self.clock.now(),
        )?;
        debug!(keys = self.directory.len(), "memory saved");
        Ok(())
    }
}
