use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{CacheEntry, Store, StoreError};
use crate::counter::unix_ms;

/// Process-memory cache tier.
///
/// Expired entries are dropped on read and by `maintain`, which also
/// enforces `max_items` by evicting in insertion order (FIFO). Maintenance
/// runs probabilistically on `set` with frequency `0 <= f <= 1`, and
/// periodically from the sweep task owned by bootstrap.
pub struct MemoryStore<V> {
    entries: DashMap<String, CacheEntry<V>>,
    /// Insertion order for FIFO eviction. Keys may already be gone from the
    /// map by the time they reach the front; those are skipped.
    insertion_order: Mutex<VecDeque<String>>,
    max_items: usize,
    maintenance_frequency: f64,
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_items: usize, maintenance_frequency: f64) -> Self {
        Self {
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            max_items,
            maintenance_frequency,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, then evict the oldest insertions until the
    /// store is back under `max_items`.
    pub fn maintain(&self, now_ms: u64) {
        let before = self.entries.len();
        self.entries.retain(|_, e| now_ms < e.stale_until);

        let mut order = self.insertion_order.lock().unwrap();
        order.retain(|k| self.entries.contains_key(k));

        while self.entries.len() > self.max_items {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            metrics::counter!("aegis_cache_evictions_total", "tier" => "memory")
                .increment(evicted as u64);
        }
    }

    /// Spawn the periodic sweep task. Call once after construction.
    pub fn start_sweep(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.maintain(unix_ms()),
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    fn compound_key(namespace: &str, key: &str) -> String {
        let mut s = String::with_capacity(namespace.len() + key.len() + 1);
        s.push_str(namespace);
        s.push('/');
        s.push_str(key);
        s
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry<V>>, StoreError> {
        let ck = Self::compound_key(namespace, key);
        let now = unix_ms();
        // The shard guard must drop before the remove below.
        let expired = match self.entries.get(&ck) {
            Some(entry) if now < entry.stale_until => return Ok(Some(entry.value().clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&ck);
        }
        Ok(None)
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry<V>) -> Result<(), StoreError> {
        let ck = Self::compound_key(namespace, key);
        let is_new = self.entries.insert(ck.clone(), entry).is_none();
        if is_new {
            self.insertion_order.lock().unwrap().push_back(ck);
        }

        if self.maintenance_frequency > 0.0
            && rand::thread_rng().gen::<f64>() < self.maintenance_frequency
        {
            self.maintain(unix_ms());
        }
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.entries.remove(&Self::compound_key(namespace, key));
        Ok(())
    }
}
