use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-session write locks. Writes to one upload session are serialized
/// without blocking other sessions.
#[derive(Debug, Clone)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires a lock for the given key.
    /// The lock is released when the returned guard is dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        mutex.lock_owned().await
    }

    /// Unlocks a finished session and forgets its lock unless another task is
    /// already waiting on it.
    pub fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Removes locks that are not currently held by any task.
    pub fn cleanup(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("a").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.lock("a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_forgets_finished_session() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("done").await;
        locks.release("done", guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_lock_with_waiters() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("busy").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.lock("busy").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        locks.release("busy", guard);
        assert_eq!(locks.len(), 1);
        waiting.await.unwrap();
        locks.cleanup();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_locks() {
        let locks = KeyedMutex::new();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            locks.cleanup();
            assert_eq!(locks.len(), 2);
        }
        locks.cleanup();
        assert!(locks.is_empty());
    }
}
