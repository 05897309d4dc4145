use chrono::{Duration, TimeZone, Utc};
use tiermem_core::{
    AgentState, Layer, ManualClock, MemoryConfig, MemoryError, QueryCriteria, TaggedMemory,
};

fn memory_at_noon() -> (TaggedMemory, ManualClock) {
    let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let memory = TaggedMemory::new(MemoryConfig::in_dir("/nonexistent")).with_clock(clock.clone());
    (memory, clock)
}

fn assert_accounting(memory: &TaggedMemory) {
    let stats = memory.stats();
    assert_eq!(
        stats.total_size,
        Layer::ALL.iter().map(|l| memory.arena(*l).len()).sum::<usize>()
    );
    for key in memory.keys().iter() {
        let names = memory.arena(key.layer).entry_names();
        assert_eq!(
            names.iter().filter(|n| **n == key.name).count(),
            1,
            "{} should have exactly one entry in the {} arena",
            key.name,
            key.layer
        );
    }
}

// ---- End-to-end ----

#[test]
fn store_and_retrieve_task_notes() {
    let (mut memory, _) = memory_at_noon();
    memory
        .store("task_notes", "Plan the launch", Layer::Working, 70)
        .unwrap();
    assert_eq!(memory.retrieve("task_notes").unwrap(), "Plan the launch");
}

#[test]
fn disk_cleanup_respects_importance_bands() {
    let (mut memory, _) = memory_at_noon();
    let payload = "x".repeat(40);
    memory.store("k90", &payload, Layer::Disk, 90).unwrap();
    memory.store("k50", &payload, Layer::Disk, 50).unwrap();
    memory.store("k10", &payload, Layer::Disk, 10).unwrap();

    let freed = memory.disk_cleanup(100).unwrap();
    assert!(freed > 0);
    assert!(memory.key("k10").is_none());
    assert_eq!(memory.key("k50").unwrap().layer, Layer::Archived);
    assert_eq!(memory.key("k90").unwrap().layer, Layer::Disk);
    assert_eq!(memory.retrieve("k50").unwrap(), payload);
    assert_accounting(&memory);
}

#[test]
fn query_by_importance_returns_descending_band() {
    let (mut memory, _) = memory_at_noon();
    for importance in [10u8, 40, 65, 80, 95] {
        memory
            .store(&format!("k{importance}"), "v", Layer::Working, importance)
            .unwrap();
    }
    let hits: Vec<u8> = memory
        .query_by_importance(60, 100, 0)
        .unwrap()
        .iter()
        .map(|r| r.key.importance)
        .collect();
    assert_eq!(hits, [95, 80, 65]);
}

// ---- Properties ----

#[test]
fn round_trip_in_every_layer_with_awkward_bytes() {
    let (mut memory, _) = memory_at_noon();
    let value = "quote \" backslash \\ tab\t newline\n unicode \u{1F980} <tag> </other>";
    for layer in Layer::ALL {
        let name = format!("v_{layer}");
        memory.store(&name, value, layer, 50).unwrap();
        assert_eq!(memory.retrieve(&name).unwrap(), value);
    }
    assert_accounting(&memory);
}

#[test]
fn create_on_existing_name_is_already_exists() {
    let (mut memory, _) = memory_at_noon();
    memory.store("dup", "v", Layer::Working, 10).unwrap();
    let err = memory.create_key("dup", Layer::Disk, 10, 1).unwrap_err();
    assert!(matches!(err, MemoryError::AlreadyExists(_)));
    assert_eq!(memory.keys().len(), 1);
}

#[test]
fn out_of_range_importance_never_mutates() {
    let (mut memory, _) = memory_at_noon();
    memory.store("k", "v", Layer::Working, 10).unwrap();
    let before = memory.keys().clone();

    assert!(memory.store("new", "v", Layer::Working, 101).is_err());
    assert!(memory.update_importance("k", 200).is_err());
    assert!(memory.create_key("other", Layer::Disk, 101, 0).is_err());
    assert_eq!(memory.keys(), &before);
}

#[test]
fn mixed_store_delete_sequence_keeps_accounting() {
    let (mut memory, clock) = memory_at_noon();
    for i in 0..20u8 {
        let layer = Layer::ALL[usize::from(i) % 3];
        memory
            .store(&format!("k{}", i % 7), &"d".repeat(usize::from(i)), layer, i * 5)
            .unwrap();
        if i % 4 == 3 {
            memory.delete(&format!("k{}", (i + 1) % 7)).ok();
        }
        clock.advance(Duration::seconds(1));
        assert_accounting(&memory);
    }
}

#[test]
fn expiry_never_touches_exempt_keys() {
    let (mut memory, clock) = memory_at_noon();
    memory.store("vital", "v", Layer::Working, 80).unwrap();
    memory.store("fleeting", "f", Layer::Working, 79).unwrap();
    clock.advance(Duration::days(365));

    assert_eq!(memory.cleanup_expired(60, false).unwrap(), 1);
    assert_eq!(memory.cleanup_expired(60, true).unwrap(), 0);
    assert_eq!(memory.key("vital").unwrap().layer, Layer::Working);
}

#[test]
fn ranking_prefers_recent_then_important() {
    let (mut memory, clock) = memory_at_noon();
    memory.store("older", "v", Layer::Working, 50).unwrap();
    clock.advance(Duration::minutes(10));
    memory.store("newer", "v", Layer::Working, 50).unwrap();
    memory.store("weaker", "v", Layer::Working, 30).unwrap();
    memory.store("stronger", "v", Layer::Working, 90).unwrap();

    let names: Vec<String> = memory
        .query(&QueryCriteria::all(), 0)
        .unwrap()
        .into_iter()
        .map(|r| r.key.name)
        .collect();
    assert_eq!(names, ["stronger", "newer", "older", "weaker"]);
}

#[test]
fn queries_do_not_refresh_recency() {
    let (mut memory, clock) = memory_at_noon();
    memory.store("idle", "v", Layer::Working, 10).unwrap();
    let stamp = memory.key("idle").unwrap().last_accessed;
    clock.advance(Duration::hours(2));
    memory.query_by_tag("id*", 10).unwrap();
    memory.query_summary(&QueryCriteria::all()).unwrap();
    assert_eq!(memory.key("idle").unwrap().last_accessed, stamp);
}

#[test]
fn state_driven_paging_keeps_bytes_with_metadata() {
    let (mut memory, clock) = memory_at_noon();
    for i in 0..6u8 {
        memory
            .store(&format!("note_{i}"), "some text", Layer::Working, 20 + i * 10)
            .unwrap();
    }
    clock.advance(Duration::hours(3));
    for state in AgentState::ALL {
        memory.context_window_optimize(state).unwrap();
        assert_accounting(&memory);
    }
    for i in 0..6 {
        assert_eq!(memory.retrieve(&format!("note_{i}")).unwrap(), "some text");
    }
}
