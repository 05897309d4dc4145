use tiermem_core::{Layer, MemoryConfig, SharedMemory, TaggedMemory};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_writers_keep_one_entry_per_key() {
    let shared = SharedMemory::new(TaggedMemory::new(MemoryConfig::in_dir("/nonexistent")));

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..25 {
                let name = format!("slot_{}", round % 5);
                let layer = Layer::ALL[(worker + round) % 3];
                let mut memory = shared.lock().await;
                memory
                    .store(&name, &format!("w{worker} r{round}"), layer, 50)
                    .unwrap();
                if round % 7 == 6 {
                    memory.delete(&name).unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let memory = shared.lock().await;
    let total: usize = Layer::ALL.iter().map(|l| memory.arena(*l).len()).sum();
    assert_eq!(memory.stats().total_size, total);
    for key in memory.keys().iter() {
        let copies: usize = Layer::ALL
            .iter()
            .map(|l| {
                memory
                    .arena(*l)
                    .entry_names()
                    .iter()
                    .filter(|n| **n == key.name)
                    .count()
            })
            .sum();
        assert_eq!(copies, 1, "{} stored more than once", key.name);
    }
}

#[tokio::test]
async fn with_runs_under_the_lock() {
    let shared = SharedMemory::new(TaggedMemory::new(MemoryConfig::in_dir("/nonexistent")));
    shared
        .with(|m| m.store("k", "v", Layer::Disk, 10))
        .await
        .unwrap();
    let value = shared.with(|m| m.retrieve("k")).await.unwrap();
    assert_eq!(value, "v");
}
