//! Load/save of the two backing files, plus backup, recovery and
//! structural validation.
//!
//! Every write goes through a temp file in the target directory followed
//! by an atomic rename, so the canonical path never holds a half-written
//! file.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::directory::{ContextKey, KeyDirectory, Layer};
use crate::error::{MemoryError, MemoryResult};

/// Records younger than this survive [`compact_files`] regardless of score.
pub const COMPACT_RECENT_SECS: i64 = 24 * 3600;

/// On-disk shape of `memory.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedArenas {
    #[serde(rename = "working_memory")]
    pub working: String,
    #[serde(rename = "disk_memory")]
    pub disk: String,
    #[serde(
        rename = "archived_memory",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub archived: String,
}

/// Outcome of [`validate`]: one flag per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub memory_ok: bool,
    pub keys_ok: bool,
}

/// Paths written by [`backup`]. `None` means the source file was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub memory: Option<PathBuf>,
    pub context_keys: Option<PathBuf>,
}

/// Which backup each file was restored from. `None` means that file was
/// not restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub memory: Option<PathBuf>,
    pub context_keys: Option<PathBuf>,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.memory.is_some() && self.context_keys.is_some()
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> MemoryResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_optional(path: &Path) -> MemoryResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// -------------------------------------------------------------------------
// memory.json
// -------------------------------------------------------------------------

/// Load the arenas. A missing file yields empty arenas.
pub fn load_memory(path: &Path) -> MemoryResult<PersistedArenas> {
    match read_optional(path)? {
        Some(text) => Ok(serde_json::from_str(&text)?),
        None => {
            debug!(path = %path.display(), "memory file absent, starting empty");
            Ok(PersistedArenas::default())
        }
    }
}

pub fn save_memory(path: &Path, working: &str, disk: &str, archived: &str) -> MemoryResult<()> {
    let file = PersistedArenas {
        working: working.to_string(),
        disk: disk.to_string(),
        archived: archived.to_string(),
    };
    write_atomic(path, &serde_json::to_vec_pretty(&file)?)
}

// -------------------------------------------------------------------------
// context_keys.json
// -------------------------------------------------------------------------

/// Load the key directory. Records that fail to parse or validate are
/// skipped with a warning; a missing file yields an empty directory.
pub fn load_context_keys(
    path: &Path,
    max_keys: usize,
    now: DateTime<Utc>,
) -> MemoryResult<KeyDirectory> {
    let Some(text) = read_optional(path)? else {
        return Ok(KeyDirectory::new(max_keys));
    };
    let raw: Vec<serde_json::Value> = serde_json::from_str(&text)?;
    let mut records = Vec::with_capacity(raw.len());
    for (idx, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<ContextKey>(value) {
            Ok(key) => records.push(key),
            Err(e) => warn!(index = idx, error = %e, "skipping incomplete context key record"),
        }
    }
    Ok(KeyDirectory::from_records(records, max_keys, now))
}

/// Save the key directory. Every record is validated first; nothing is
/// written if any record is invalid.
pub fn save_context_keys(path: &Path, dir: &KeyDirectory, now: DateTime<Utc>) -> MemoryResult<()> {
    for key in dir.iter() {
        key.validate(now)?;
    }
    write_atomic(path, &serde_json::to_vec_pretty(dir.as_slice())?)
}

/// Create both files empty, overwriting whatever is there.
pub fn initialize(memory_file: &Path, keys_file: &Path) -> MemoryResult<()> {
    save_memory(memory_file, "", "", "")?;
    write_atomic(keys_file, b"[]")?;
    info!(
        event = "memory_files_initialized",
        memory_file = %memory_file.display(),
        keys_file = %keys_file.display(),
    );
    Ok(())
}

// -------------------------------------------------------------------------
// validation
// -------------------------------------------------------------------------

/// Whether `{`/`}` and `[`/`]` balance outside of string literals.
fn brackets_balanced(text: &str) -> bool {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(c),
            '}' if stack.pop() != Some('{') => return false,
            ']' if stack.pop() != Some('[') => return false,
            _ => {}
        }
    }
    !in_string && stack.is_empty()
}

pub fn memory_text_is_valid(text: &str) -> bool {
    brackets_balanced(text) && serde_json::from_str::<PersistedArenas>(text).is_ok()
}

pub fn keys_text_is_valid(text: &str) -> bool {
    brackets_balanced(text) && serde_json::from_str::<Vec<serde_json::Value>>(text).is_ok()
}

/// Structural checks on both files. A missing file is not valid.
pub fn validate(memory_file: &Path, keys_file: &Path) -> MemoryResult<ValidationReport> {
    let memory_ok = read_optional(memory_file)?.is_some_and(|t| memory_text_is_valid(&t));
    let keys_ok = read_optional(keys_file)?.is_some_and(|t| keys_text_is_valid(&t));
    Ok(ValidationReport { memory_ok, keys_ok })
}

// -------------------------------------------------------------------------
// backup / recover
// -------------------------------------------------------------------------

fn split_name(file: &Path) -> (String, String) {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// Timestamped backups of `file` in `backup_dir`, oldest first.
pub fn list_backups(file: &Path, backup_dir: &Path) -> MemoryResult<Vec<PathBuf>> {
    let (stem, ext) = split_name(file);
    let pattern = format!(
        r"^{}_(\d{{8}}_\d{{6}})(?:_(\d+))?{}$",
        regex::escape(&stem),
        regex::escape(&ext)
    );
    let re = Regex::new(&pattern).map_err(|e| MemoryError::invalid(e.to_string()))?;

    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(caps) = re.captures(&name) {
            let stamp = caps[1].to_string();
            let seq: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            found.push((stamp, seq, path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, _, path)| path).collect())
}

fn backup_path(file: &Path, backup_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    let (stem, ext) = split_name(file);
    let base = format!("{stem}_{}", now.format("%Y%m%d_%H%M%S"));
    let mut candidate = backup_dir.join(format!("{base}{ext}"));
    let mut seq = 1;
    while candidate.exists() {
        candidate = backup_dir.join(format!("{base}_{seq}{ext}"));
        seq += 1;
    }
    candidate
}

fn backup_one(
    file: &Path,
    backup_dir: &Path,
    now: DateTime<Utc>,
) -> MemoryResult<Option<PathBuf>> {
    let Some(text) = read_optional(file)? else {
        return Ok(None);
    };
    let target = backup_path(file, backup_dir, now);
    write_atomic(&target, text.as_bytes())?;
    Ok(Some(target))
}

fn prune_backups(file: &Path, backup_dir: &Path, keep: usize) -> MemoryResult<usize> {
    if keep == 0 {
        return Ok(0);
    }
    let backups = list_backups(file, backup_dir)?;
    let excess = backups.len().saturating_sub(keep);
    for old in &backups[..excess] {
        if let Err(e) = fs::remove_file(old) {
            warn!(path = %old.display(), error = %e, "failed to prune old backup");
        }
    }
    Ok(excess)
}

/// Copy both files into `backup_dir` as `<stem>_YYYYMMDD_HHMMSS<ext>`,
/// then prune each family to the newest `keep` copies (0 keeps all).
///
/// Absent sources are skipped. If the second copy fails the first is
/// removed again and the call fails.
pub fn backup(
    memory_file: &Path,
    keys_file: &Path,
    backup_dir: &Path,
    keep: usize,
    now: DateTime<Utc>,
) -> MemoryResult<BackupReport> {
    let memory = backup_one(memory_file, backup_dir, now)?;
    let context_keys = match backup_one(keys_file, backup_dir, now) {
        Ok(path) => path,
        Err(e) => {
            if let Some(partial) = &memory {
                fs::remove_file(partial).ok();
            }
            return Err(e);
        }
    };
    prune_backups(memory_file, backup_dir, keep)?;
    prune_backups(keys_file, backup_dir, keep)?;
    info!(
        event = "backup_created",
        memory = ?memory,
        context_keys = ?context_keys,
    );
    Ok(BackupReport {
        memory,
        context_keys,
    })
}

/// `<file>.backup`, the single-copy backup form.
pub fn simple_backup_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Copy `file` to `<file>.backup`. Returns `None` if `file` is absent.
pub fn simple_backup(file: &Path) -> MemoryResult<Option<PathBuf>> {
    let Some(text) = read_optional(file)? else {
        return Ok(None);
    };
    let target = simple_backup_path(file);
    write_atomic(&target, text.as_bytes())?;
    Ok(Some(target))
}

/// Restore `file` from the newest valid candidate. Returns the candidate
/// used, or `None`, plus whether any candidate existed at all.
fn recover_one(
    file: &Path,
    backup_dir: &Path,
    is_valid: fn(&str) -> bool,
) -> MemoryResult<(Option<PathBuf>, bool)> {
    let mut candidates = list_backups(file, backup_dir)?;
    candidates.reverse();
    let simple = simple_backup_path(file);
    if simple.exists() {
        candidates.push(simple);
    }
    let any = !candidates.is_empty();

    for candidate in candidates {
        let text = match fs::read_to_string(&candidate) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "unreadable backup");
                continue;
            }
        };
        if !is_valid(&text) {
            warn!(path = %candidate.display(), "backup failed validation, trying older");
            continue;
        }
        write_atomic(file, text.as_bytes())?;
        info!(event = "file_recovered", file = %file.display(), from = %candidate.display());
        return Ok((Some(candidate), any));
    }
    Ok((None, any))
}

/// Restore both files from their newest valid backups.
///
/// Each file is handled independently and the report says which were
/// restored. Fails with `NotFound` when neither file has any backup and
/// with `Validation` when backups exist but none is usable.
pub fn recover(
    memory_file: &Path,
    keys_file: &Path,
    backup_dir: &Path,
) -> MemoryResult<RecoveryReport> {
    let (memory, memory_any) = recover_one(memory_file, backup_dir, memory_text_is_valid)?;
    let (context_keys, keys_any) = recover_one(keys_file, backup_dir, keys_text_is_valid)?;
    if !memory_any && !keys_any {
        return Err(MemoryError::not_found(format!(
            "no backups for {} or {}",
            memory_file.display(),
            keys_file.display()
        )));
    }
    if memory.is_none() && context_keys.is_none() {
        return Err(MemoryError::Validation(
            "backups exist but none passed validation".into(),
        ));
    }
    Ok(RecoveryReport {
        memory,
        context_keys,
    })
}

/// Drop persisted records that are older than a day, below `threshold`
/// importance and not in the working layer, together with their bytes.
///
/// Both files get a `.backup` copy first. Returns the number of records
/// removed.
pub fn compact_files(
    memory_file: &Path,
    keys_file: &Path,
    threshold: u8,
    max_keys: usize,
    now: DateTime<Utc>,
) -> MemoryResult<usize> {
    simple_backup(memory_file)?;
    simple_backup(keys_file)?;

    let persisted = load_memory(memory_file)?;
    let mut arenas = [
        Arena::from_bytes(persisted.working.as_bytes())?,
        Arena::from_bytes(persisted.disk.as_bytes())?,
        Arena::from_bytes(persisted.archived.as_bytes())?,
    ];
    let dir = load_context_keys(keys_file, max_keys, now)?;

    let mut kept = KeyDirectory::new(max_keys);
    let mut removed = 0;
    for key in dir.iter() {
        let recent = now - key.last_accessed < Duration::seconds(COMPACT_RECENT_SECS);
        if recent || key.importance >= threshold || key.layer == Layer::Working {
            kept.create(&key.name, key.layer, key.importance, key.data_size, key.last_accessed)?;
        } else {
            for arena in &mut arenas {
                arena.remove_all(&key.name)?;
            }
            removed += 1;
        }
    }

    save_memory(
        memory_file,
        &arenas[0].as_str(),
        &arenas[1].as_str(),
        &arenas[2].as_str(),
    )?;
    save_context_keys(keys_file, &kept, now)?;
    info!(event = "files_compacted", removed, kept = kept.len());
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn make_files() -> (tempfile::TempDir, PathBuf, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let memory = dir.path().join("memory.json");
        let keys = dir.path().join("context_keys.json");
        let backups = dir.path().join("backups");
        (dir, memory, keys, backups)
    }

    #[test]
    fn missing_files_load_empty() {
        let (_dir, memory, keys, _) = make_files();
        assert_eq!(load_memory(&memory).unwrap(), PersistedArenas::default());
        assert!(load_context_keys(&keys, 8, t0()).unwrap().is_empty());
    }

    #[test]
    fn memory_save_load_is_exact() {
        let (_dir, memory, _, _) = make_files();
        let working = "\n<key:a>\nquote \" backslash \\ tab \t ctrl \u{1}\n</key>\n";
        let disk = "\n<key:b>\nunicode: héllo ✓\n</key>\n";
        save_memory(&memory, working, disk, "").unwrap();
        let loaded = load_memory(&memory).unwrap();
        assert_eq!(loaded.working, working);
        assert_eq!(loaded.disk, disk);
        assert_eq!(loaded.archived, "");
        let raw = fs::read_to_string(&memory).unwrap();
        assert!(raw.contains("\"working_memory\""));
        assert!(!raw.contains("archived_memory"));
    }

    #[test]
    fn keys_load_skips_bad_records() {
        let (_dir, _, keys, _) = make_files();
        fs::write(
            &keys,
            r#"[
                {"key": "ok", "layer": "disk", "importance_score": 40, "last_accessed": 1717243200, "data_size": 3},
                {"key": "no_layer", "importance_score": 40, "last_accessed": 1717243200, "data_size": 3},
                {"key": "too_important", "layer": "working", "importance_score": 140, "last_accessed": 1717243200, "data_size": 3}
            ]"#,
        )
        .unwrap();
        let dir = load_context_keys(&keys, 8, t0()).unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("ok").unwrap().layer, Layer::Disk);
    }

    #[test]
    fn validate_checks_structure() {
        let (_dir, memory, keys, _) = make_files();
        assert_eq!(
            validate(&memory, &keys).unwrap(),
            ValidationReport {
                memory_ok: false,
                keys_ok: false
            }
        );
        initialize(&memory, &keys).unwrap();
        let report = validate(&memory, &keys).unwrap();
        assert!(report.memory_ok && report.keys_ok);

        fs::write(&memory, r#"{"working_memory": "x", "disk_memory": "y""#).unwrap();
        assert!(!validate(&memory, &keys).unwrap().memory_ok);
        assert!(brackets_balanced(r#"{"a": "}{]["}"#));
    }

    #[test]
    fn backup_names_and_prunes() {
        let (_dir, memory, keys, backups) = make_files();
        initialize(&memory, &keys).unwrap();
        for i in 0..4 {
            backup(&memory, &keys, &backups, 3, t0() + Duration::seconds(i)).unwrap();
        }
        let listed = list_backups(&memory, &backups).unwrap();
        assert_eq!(listed.len(), 3);
        let newest = listed.last().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(newest, "memory_20240601_120003.json");
        assert_eq!(list_backups(&keys, &backups).unwrap().len(), 3);
    }

    #[test]
    fn same_second_backups_do_not_collide() {
        let (_dir, memory, keys, backups) = make_files();
        initialize(&memory, &keys).unwrap();
        let first = backup(&memory, &keys, &backups, 0, t0()).unwrap();
        let second = backup(&memory, &keys, &backups, 0, t0()).unwrap();
        assert_ne!(first.memory, second.memory);
        let listed = list_backups(&memory, &backups).unwrap();
        assert_eq!(listed.last(), second.memory.as_ref());
    }

    #[test]
    fn backup_of_missing_files_is_not_an_error() {
        let (_dir, memory, keys, backups) = make_files();
        let report = backup(&memory, &keys, &backups, 10, t0()).unwrap();
        assert_eq!(report, BackupReport::default());
    }

    #[test]
    fn recover_without_backups_is_not_found() {
        let (_dir, memory, keys, backups) = make_files();
        assert!(recover(&memory, &keys, &backups).unwrap_err().is_not_found());
    }

    #[test]
    fn recover_skips_corrupt_newest_backup() {
        let (_dir, memory, keys, backups) = make_files();
        save_memory(&memory, "good", "", "").unwrap();
        fs::write(&keys, "[]").unwrap();
        backup(&memory, &keys, &backups, 0, t0()).unwrap();
        let newer = backup(&memory, &keys, &backups, 0, t0() + Duration::hours(1)).unwrap();
        fs::write(newer.memory.unwrap(), "{ not json").unwrap();

        fs::remove_file(&memory).unwrap();
        let report = recover(&memory, &keys, &backups).unwrap();
        assert!(report.is_complete());
        assert_eq!(load_memory(&memory).unwrap().working, "good");
    }

    #[test]
    fn recover_falls_back_to_simple_backup() {
        let (_dir, memory, keys, backups) = make_files();
        save_memory(&memory, "w", "d", "").unwrap();
        simple_backup(&memory).unwrap();
        fs::write(&memory, "garbage").unwrap();
        let report = recover(&memory, &keys, &backups).unwrap();
        assert_eq!(report.memory, Some(simple_backup_path(&memory)));
        assert!(report.context_keys.is_none());
        assert_eq!(load_memory(&memory).unwrap().disk, "d");
    }

    #[test]
    fn compact_files_drops_stale_unimportant_records() {
        let (_dir, memory, keys, _) = make_files();
        let mut arenas = [Arena::new(), Arena::new(), Arena::new()];
        let mut dir = KeyDirectory::new(8);
        let old = t0() - Duration::days(3);
        for (name, layer, importance, when) in [
            ("stale_low", Layer::Disk, 10, old),
            ("stale_high", Layer::Disk, 90, old),
            ("stale_working", Layer::Working, 10, old),
            ("fresh_low", Layer::Disk, 10, t0()),
        ] {
            arenas[match layer {
                Layer::Working => 0,
                _ => 1,
            }]
            .append_entry(name, b"data")
            .unwrap();
            dir.create(name, layer, importance, 4, when).unwrap();
        }
        save_memory(&memory, &arenas[0].as_str(), &arenas[1].as_str(), "").unwrap();
        save_context_keys(&keys, &dir, t0()).unwrap();

        assert_eq!(compact_files(&memory, &keys, 50, 8, t0()).unwrap(), 1);
        let dir = load_context_keys(&keys, 8, t0()).unwrap();
        assert!(dir.get("stale_low").is_none());
        assert_eq!(dir.len(), 3);
        assert!(!load_memory(&memory).unwrap().disk.contains("stale_low"));
        assert!(simple_backup_path(&keys).exists());
    }
}
