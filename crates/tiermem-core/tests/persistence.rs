use chrono::{Duration, TimeZone, Utc};
use std::fs;
use tempfile::tempdir;
use tiermem_core::{persist, Layer, ManualClock, MemoryConfig, TaggedMemory};

fn noon() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn open_at(config: &MemoryConfig, clock: &ManualClock) -> TaggedMemory {
    TaggedMemory::open(config.clone())
        .unwrap()
        .with_clock(clock.clone())
}

// ---- Restart ----

#[test]
fn open_on_empty_dir_creates_both_files() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let memory = TaggedMemory::open(config.clone()).unwrap();
    assert!(memory.keys().is_empty());
    assert!(config.memory_file.exists());
    assert!(config.context_keys_file.exists());
}

#[test]
fn save_then_reopen_reproduces_directory_and_arenas() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let clock = ManualClock::at(noon());

    let mut memory = open_at(&config, &clock);
    memory
        .store("task_notes", "Plan the launch", Layer::Working, 70)
        .unwrap();
    clock.advance(Duration::minutes(5));
    memory
        .store("log", "line one\nline \"two\"\tend\u{7}", Layer::Disk, 30)
        .unwrap();
    memory.store("cold", "old stuff", Layer::Archived, 5).unwrap();
    memory.save().unwrap();

    let reopened = open_at(&config, &clock);
    assert_eq!(reopened.keys(), memory.keys());
    for layer in Layer::ALL {
        assert_eq!(reopened.arena(layer), memory.arena(layer));
    }
}

#[test]
fn persisted_json_uses_documented_field_names() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let clock = ManualClock::at(noon());
    let mut memory = open_at(&config, &clock);
    memory.store("k", "v", Layer::Disk, 42).unwrap();
    memory.save().unwrap();

    let arenas: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config.memory_file).unwrap()).unwrap();
    assert_eq!(arenas["working_memory"], "");
    assert_eq!(arenas["disk_memory"], "\n<key:k>\nv\n</key>\n");

    let keys: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config.context_keys_file).unwrap()).unwrap();
    let record = &keys[0];
    assert_eq!(record["key"], "k");
    assert_eq!(record["layer"], "disk");
    assert_eq!(record["importance_score"], 42);
    assert_eq!(record["last_accessed"], noon().timestamp());
    assert_eq!(record["data_size"], 1);
}

#[test]
fn invalid_key_records_are_skipped_on_load() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    fs::write(
        &config.memory_file,
        r#"{"working_memory":"\n<key:good>\nok\n</key>\n","disk_memory":""}"#,
    )
    .unwrap();
    fs::write(
        &config.context_keys_file,
        format!(
            r#"[
  {{"key":"good","layer":"working","importance_score":50,"last_accessed":{t},"data_size":2}},
  {{"key":"","layer":"working","importance_score":50,"last_accessed":{t},"data_size":0}},
  {{"key":"loud","layer":"disk","importance_score":250,"last_accessed":{t},"data_size":0}}
]"#,
            t = noon().timestamp()
        ),
    )
    .unwrap();

    let mut memory = open_at(&config, &ManualClock::at(noon()));
    assert_eq!(memory.keys().len(), 1);
    assert_eq!(memory.retrieve("good").unwrap(), "ok");
}

#[test]
fn archived_bytes_in_disk_arena_are_adopted_on_load() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    fs::write(
        &config.memory_file,
        r#"{"working_memory":"","disk_memory":"\n<key:hot>\nh\n</key>\n\n<key:cold>\nold notes\n</key>\n"}"#,
    )
    .unwrap();
    fs::write(
        &config.context_keys_file,
        format!(
            r#"[
  {{"key":"hot","layer":"disk","importance_score":50,"last_accessed":{t},"data_size":1}},
  {{"key":"cold","layer":"archived","importance_score":20,"last_accessed":{t},"data_size":9}}
]"#,
            t = noon().timestamp()
        ),
    )
    .unwrap();

    let mut memory = open_at(&config, &ManualClock::at(noon()));
    assert_eq!(memory.retrieve("cold").unwrap(), "old notes");
    assert_eq!(memory.retrieve("hot").unwrap(), "h");
    assert_eq!(memory.arena(Layer::Disk).entry_names(), ["hot"]);
    assert_eq!(memory.arena(Layer::Archived).entry_names(), ["cold"]);
    assert!(memory.disk_verify().unwrap().is_valid());
}

// ---- Backup / recover ----

#[test]
fn recover_without_backups_is_not_found() {
    let dir = tempdir().unwrap();
    let mut memory = TaggedMemory::open(MemoryConfig::in_dir(dir.path())).unwrap();
    let err = memory.recover_from_backup().unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn recover_restores_after_corruption() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let clock = ManualClock::at(noon());
    let mut memory = open_at(&config, &clock);
    memory.store("plan", "ship friday", Layer::Working, 60).unwrap();
    let backup = memory.disk_backup().unwrap();
    assert!(backup.memory.is_some() && backup.context_keys.is_some());

    fs::write(&config.memory_file, "{ not json").unwrap();
    let report = memory.recover_from_backup().unwrap();
    assert!(report.is_complete());
    assert_eq!(memory.retrieve("plan").unwrap(), "ship friday");
}

#[test]
fn recover_skips_a_corrupt_newest_backup() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let clock = ManualClock::at(noon());
    let mut memory = open_at(&config, &clock);

    memory.store("plan", "first draft", Layer::Working, 60).unwrap();
    memory.disk_backup().unwrap();
    clock.advance(Duration::minutes(1));
    memory.store("plan", "second draft", Layer::Working, 60).unwrap();
    let newest = memory.disk_backup().unwrap();

    fs::write(newest.memory.unwrap(), "{\"working_memory\": ").unwrap();
    fs::remove_file(&config.memory_file).unwrap();

    let report = memory.recover_from_backup().unwrap();
    assert!(report.memory.is_some());
    assert_eq!(memory.retrieve("plan").unwrap(), "first draft");
}

#[test]
fn backups_are_pruned_per_family() {
    let dir = tempdir().unwrap();
    let mut config = MemoryConfig::in_dir(dir.path());
    config.max_backups = 2;
    let clock = ManualClock::at(noon());
    let mut memory = open_at(&config, &clock);
    memory.store("k", "v", Layer::Working, 10).unwrap();

    for _ in 0..4 {
        memory.disk_backup().unwrap();
        clock.advance(Duration::seconds(1));
    }
    assert_eq!(
        persist::list_backups(&config.memory_file, &config.backup_dir)
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        persist::list_backups(&config.context_keys_file, &config.backup_dir)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn compaction_persists_and_verifies() {
    let dir = tempdir().unwrap();
    let config = MemoryConfig::in_dir(dir.path());
    let clock = ManualClock::at(noon());
    let mut memory = open_at(&config, &clock);
    memory.store("stale", "s", Layer::Working, 10).unwrap();
    clock.advance(Duration::days(40));
    memory.store("fresh", "f   f", Layer::Disk, 10).unwrap();

    assert_eq!(memory.compact(false).unwrap(), 1);
    let report = memory.disk_compact().unwrap();
    assert_eq!(report.recompressed, 1);
    assert!(memory.disk_verify().unwrap().is_valid());

    let mut reopened = open_at(&config, &clock);
    assert_eq!(reopened.key("stale").unwrap().layer, Layer::Archived);
    assert_eq!(reopened.retrieve("fresh").unwrap(), "f f");
}
