use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use super::{Store, StoreError, Updater};
use crate::gateway::clock::{Clock, SystemClock};

struct Entry<V> {
    value: V,
    written_ms: i64,
}

/// In-process store. State is lost on restart and not shared between
/// instances.
pub struct MemoryStore<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V> fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl<V> MemoryStore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose write times come from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn entry(&self, value: V) -> Entry<V> {
        Entry {
            value,
            written_ms: self.clock.now_ms(),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: V) -> Result<(), StoreError> {
        let entry = self.entry(value);
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn purge_idle(&self, max_idle: Duration) -> Result<u64, StoreError> {
        let max_idle_ms = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ms().saturating_sub(max_idle_ms);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.written_ms >= cutoff);
        Ok(u64::try_from(before - entries.len()).unwrap_or(u64::MAX))
    }

    async fn update(&self, key: &str, f: Updater<V>) -> Result<Option<V>, StoreError> {
        // The guard is held across the closure so the read-modify-write is one step.
        let mut entries = self.entries.lock().await;
        let current = entries.remove(key).map(|entry| entry.value);
        let next = f(current);
        if let Some(value) = &next {
            let entry = self.entry(value.clone());
            entries.insert(key.to_string(), entry);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::clock::ManualClock;
    use anyhow::Result;

    #[tokio::test]
    async fn set_get_delete() -> Result<()> {
        let store: MemoryStore<u32> = MemoryStore::new();
        store.set("a", 1).await?;
        assert_eq!(store.get("a").await?, Some(1));
        store.delete("a").await?;
        assert_eq!(store.get("a").await?, None);
        // deleting twice is fine
        store.delete("a").await?;
        Ok(())
    }

    #[tokio::test]
    async fn update_can_remove() -> Result<()> {
        let store: MemoryStore<u32> = MemoryStore::new();
        store.set("a", 1).await?;
        let next = store.update("a", Box::new(|_| None)).await?;
        assert_eq!(next, None);
        assert!(store.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn purge_idle_drops_only_stale_keys() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let store: MemoryStore<u32> = MemoryStore::with_clock(clock.clone());
        for i in 0..100 {
            store.set(&format!("ip:10.0.0.{i}"), 1).await?;
        }
        clock.advance_ms(50_000);
        store.set("ip:10.0.1.1", 1).await?;
        store
            .update("ip:10.0.0.7", Box::new(|current| current.map(|n| n + 1)))
            .await?;
        clock.advance_ms(20_000);

        let removed = store.purge_idle(Duration::from_secs(60)).await?;
        assert_eq!(removed, 99);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("ip:10.0.0.7").await?, Some(2));
        assert_eq!(store.get("ip:10.0.1.1").await?, Some(1));
        assert_eq!(store.get("ip:10.0.0.8").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() -> Result<()> {
        let store: Arc<MemoryStore<Vec<u32>>> = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        "k",
                        Box::new(move |current| {
                            let mut list = current.unwrap_or_default();
                            list.push(i);
                            Some(list)
                        }),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        let list = store.get("k").await?.unwrap_or_default();
        assert_eq!(list.len(), 50);
        Ok(())
    }
}
