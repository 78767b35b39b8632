//! Short-TTL read cache over the three expensive aggregated queries
//! (latency, uptime, target-status). Invalidated wholesale on every result
//! submission by bumping an epoch counter rather than walking live entries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    epoch: u64,
}

pub struct QueryCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    epoch: AtomicU64,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> QueryCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.epoch != self.epoch.load(Ordering::Acquire) {
            return None;
        }
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                epoch: self.epoch.load(Ordering::Acquire),
            },
        );
    }

    /// Invalidates every cached entry, regardless of key, in O(1).
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalidate_discards_stale_entries_without_clearing_map() {
        let cache: QueryCache<String, u32> = QueryCache::new(Duration::from_secs(10));
        cache.put("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        cache.invalidate();
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache: QueryCache<String, u32> = QueryCache::new(Duration::from_millis(10));
        cache.put("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }
}
