//! Async handle for sharing one [`TaggedMemory`] between tasks.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::memory::TaggedMemory;

/// Cloneable handle that serializes every operation behind one mutex.
///
/// Store and delete touch the directory and an arena in separate steps, so
/// the whole aggregate is locked at once; there is no finer-grained access.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    inner: Arc<Mutex<TaggedMemory>>,
}

impl SharedMemory {
    pub fn new(memory: TaggedMemory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(memory)),
        }
    }

    /// Exclusive access until the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, TaggedMemory> {
        self.inner.lock().await
    }

    /// Run `f` under the lock.
    pub async fn with<R>(&self, f: impl FnOnce(&mut TaggedMemory) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut *guard)
    }

    /// Unwrap the memory if this is the last handle.
    pub fn try_into_inner(self) -> Result<TaggedMemory, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Layer;
    use crate::memory::tests::make_memory;

    #[tokio::test]
    async fn concurrent_stores_all_land() {
        let (memory, _) = make_memory();
        let shared = SharedMemory::new(memory);

        let mut handles = Vec::new();
        for i in 0..16 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                shared
                    .with(|m| m.store(&format!("task_{i}"), &format!("result {i}"), Layer::Working, 50))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut memory = shared.try_into_inner().unwrap();
        assert_eq!(memory.keys().len(), 16);
        assert_eq!(memory.arena(Layer::Working).entry_names().len(), 16);
        assert_eq!(memory.retrieve("task_7").unwrap(), "result 7");
    }
}
