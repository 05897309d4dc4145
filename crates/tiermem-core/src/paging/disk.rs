//! Disk-layer housekeeping: compressed stores, archive files, quota
//! cleanup, compaction with rollback, backups and verification.

use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::MemoryConfig;
use crate::directory::{ContextKey, Layer};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::TaggedMemory;
use crate::persist::{self, BackupReport, RecoveryReport};

/// Importance assigned by [`TaggedMemory::disk_store`].
pub const DISK_IMPORTANCE: u8 = 70;
/// Disk keys below this importance are deleted by quota cleanup; those
/// from here up to the expiry exemption are archived.
pub const ARCHIVE_MIN_IMPORTANCE: u8 = 40;
/// Share of retrievable keys [`TaggedMemory::disk_verify`] requires.
pub const VERIFY_MIN_PERCENT: usize = 90;

/// Outcome of [`TaggedMemory::disk_compact`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskCompactReport {
    pub backup: BackupReport,
    pub bytes_reclaimed: usize,
    pub recompressed: usize,
}

/// Outcome of [`TaggedMemory::disk_verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub memory_file_ok: bool,
    pub keys_file_ok: bool,
    pub total_keys: usize,
    pub retrievable_keys: usize,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.memory_file_ok
            && self.keys_file_ok
            && self.retrievable_keys * 100 >= self.total_keys * VERIFY_MIN_PERCENT
    }
}

/// Outcome of [`TaggedMemory::enforce_budgets`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    pub working_keys_affected: usize,
    pub disk_bytes_freed: usize,
}

impl TaggedMemory {
    /// Restore the files named in `config` from their newest valid
    /// backups, then open them.
    ///
    /// Unlike [`recover_from_backup`](Self::recover_from_backup) this works
    /// when the live files are too damaged to open.
    pub fn recover(config: MemoryConfig) -> MemoryResult<(Self, RecoveryReport)> {
        config.validate()?;
        let report = persist::recover(
            &config.memory_file,
            &config.context_keys_file,
            &config.backup_dir,
        )?;
        info!(
            event = "memory_recovered",
            memory = report.memory.is_some(),
            context_keys = report.context_keys.is_some(),
        );
        let memory = Self::open(config)?;
        Ok((memory, report))
    }

    /// Verify the files named in `config` without requiring them to load.
    ///
    /// Files that fail structural checks or cannot be opened yield a
    /// report with no retrievable keys instead of an error.
    pub fn verify_files(config: &MemoryConfig) -> MemoryResult<VerifyReport> {
        let files = persist::validate(&config.memory_file, &config.context_keys_file)?;
        if files.memory_ok && files.keys_ok {
            match Self::open(config.clone()) {
                Ok(memory) => return memory.disk_verify(),
                Err(e) => warn!(error = %e, "memory files pass checks but do not load"),
            }
        }
        let report = VerifyReport {
            memory_file_ok: files.memory_ok,
            keys_file_ok: files.keys_ok,
            total_keys: 0,
            retrievable_keys: 0,
        };
        warn!(report = ?report, "memory verification failed");
        Ok(report)
    }

    /// Bring both bounded layers back under the configured
    /// `max_working_size` and `max_disk_size` budgets.
    ///
    /// Working overflow is handled first, since demotion grows the disk
    /// layer.
    pub fn enforce_budgets(&mut self) -> MemoryResult<BudgetReport> {
        let max_working = self.config().max_working_size;
        let max_disk = self.config().max_disk_size;
        let working_keys_affected = self.manage_overflow(max_working)?;
        let disk_bytes_freed = self.disk_cleanup(max_disk)?;
        Ok(BudgetReport {
            working_keys_affected,
            disk_bytes_freed,
        })
    }

    /// Store into the disk layer at importance 70, optionally compressed.
    pub fn disk_store(&mut self, name: &str, data: &str, compress: bool) -> MemoryResult<()> {
        let payload = if compress {
            self.compressor().compress(data)
        } else {
            data.to_string()
        };
        self.store(name, &payload, Layer::Disk, DISK_IMPORTANCE)
    }

    /// Retrieve and decompress; reading raises importance to at least 70.
    pub fn disk_retrieve(&mut self, name: &str) -> MemoryResult<String> {
        let raw = self.retrieve(name)?;
        let importance = self.key(name).map_or(DISK_IMPORTANCE, |k| k.importance);
        if importance < DISK_IMPORTANCE {
            self.update_importance(name, DISK_IMPORTANCE)?;
        }
        Ok(self.compressor().decompress(&raw))
    }

    /// Compress a key, write it to `<archive_dir>/<name>.archive` and move
    /// it into the archived layer. Returns the archive file path.
    pub fn archive_to_file(&mut self, name: &str) -> MemoryResult<PathBuf> {
        let data = self.peek(name)?;
        let compressed = self.compressor().compress(&data);
        let path = self.config().archive_dir.join(format!("{name}.archive"));
        persist::write_atomic(&path, compressed.as_bytes())?;
        self.relocate(name, Layer::Archived)?;
        self.rewrite(name, &compressed)?;
        info!(event = "key_archived", key = name, path = %path.display());
        Ok(path)
    }

    /// Free disk-layer space when it exceeds `max_disk_usage` bytes.
    ///
    /// Candidates are disk keys, least important and then oldest first.
    /// Keys at or above 80 are skipped, keys in `[40, 80)` are compressed
    /// into the archived layer and keys below 40 are deleted, until usage
    /// is back to 90% of the cap. Returns the disk bytes freed.
    pub fn disk_cleanup(&mut self, max_disk_usage: usize) -> MemoryResult<usize> {
        if max_disk_usage == 0 {
            return Err(MemoryError::invalid("max_disk_usage must be positive"));
        }
        let disk_size = self.arena(Layer::Disk).len();
        if disk_size <= max_disk_usage {
            return Ok(0);
        }
        let target = disk_size - max_disk_usage * 9 / 10;

        let exempt = self.config().expiry_exemption_importance;
        let mut freed = 0;
        for key in self.disk_eviction_order() {
            if freed >= target {
                break;
            }
            if key.importance >= exempt {
                continue;
            }
            let before = self.arena(Layer::Disk).len();
            let outcome = if key.importance >= ARCHIVE_MIN_IMPORTANCE {
                self.archive_in_place(&key.name)
            } else {
                self.delete(&key.name)
            };
            match outcome {
                Ok(()) => freed += before.saturating_sub(self.arena(Layer::Disk).len()),
                Err(e) => warn!(key = %key.name, error = %e, "disk cleanup skipped key"),
            }
        }
        info!(event = "disk_cleanup", freed, target, max_disk_usage);
        Ok(freed)
    }

    /// Move a key to the archived layer and compress its bytes there.
    fn archive_in_place(&mut self, name: &str) -> MemoryResult<()> {
        self.relocate(name, Layer::Archived)?;
        let data = self.peek(name)?;
        let compressed = self.compressor().compress(&data);
        if compressed != data {
            self.rewrite(name, &compressed)?;
        }
        Ok(())
    }

    /// Save the current state and copy both files into the backup
    /// directory, keeping the newest `max_backups` of each.
    pub fn disk_backup(&self) -> MemoryResult<BackupReport> {
        self.save()?;
        let config = self.config();
        persist::backup(
            &config.memory_file,
            &config.context_keys_file,
            &config.backup_dir,
            config.max_backups,
            self.now(),
        )
    }

    /// Restore both files from the newest valid backups and reload.
    pub fn recover_from_backup(&mut self) -> MemoryResult<RecoveryReport> {
        let config = self.config().clone();
        let report = persist::recover(
            &config.memory_file,
            &config.context_keys_file,
            &config.backup_dir,
        )?;
        self.reload()?;
        Ok(report)
    }

    /// Backup, defragment, recompress every disk entry, then persist.
    ///
    /// If persisting fails the files are restored from the backup taken at
    /// the start before the error is returned.
    pub fn disk_compact(&mut self) -> MemoryResult<DiskCompactReport> {
        let backup = self.disk_backup()?;
        let bytes_reclaimed = self.defragment()?;

        let compressor = self.compressor();
        let disk_keys: Vec<String> = self
            .keys()
            .iter()
            .filter(|k| k.layer == Layer::Disk)
            .map(|k| k.name.clone())
            .collect();
        let mut recompressed = 0;
        for name in disk_keys {
            let outcome = self.peek(&name).and_then(|data| {
                let compressed = compressor.compress(&data);
                if compressed == data {
                    return Ok(false);
                }
                self.rewrite(&name, &compressed).map(|()| true)
            });
            match outcome {
                Ok(true) => recompressed += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %name, error = %e, "recompression skipped key"),
            }
        }

        if let Err(e) = self.save() {
            error!(error = %e, "persist after compaction failed, restoring backup");
            let config = self.config();
            if let Err(re) = persist::recover(
                &config.memory_file,
                &config.context_keys_file,
                &config.backup_dir,
            ) {
                error!(error = %re, "rollback after failed compaction also failed");
            }
            return Err(e);
        }
        info!(event = "disk_compacted", bytes_reclaimed, recompressed);
        Ok(DiskCompactReport {
            backup,
            bytes_reclaimed,
            recompressed,
        })
    }

    /// Check both files and how many keys can actually be read back.
    pub fn disk_verify(&self) -> MemoryResult<VerifyReport> {
        let config = self.config();
        let files = persist::validate(&config.memory_file, &config.context_keys_file)?;
        let total_keys = self.keys().len();
        let retrievable_keys = self
            .keys()
            .iter()
            .filter(|k| self.peek(&k.name).is_ok())
            .count();
        let report = VerifyReport {
            memory_file_ok: files.memory_ok,
            keys_file_ok: files.keys_ok,
            total_keys,
            retrievable_keys,
        };
        if !report.is_valid() {
            warn!(report = ?report, "memory verification failed");
        }
        Ok(report)
    }

    /// Disk keys ordered for eviction: least important, then oldest.
    pub fn disk_eviction_order(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self
            .keys()
            .iter()
            .filter(|k| k.layer == Layer::Disk)
            .cloned()
            .collect();
        keys.sort_by_key(|k| (k.importance, k.last_accessed));
        keys
    }
}
