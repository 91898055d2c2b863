pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::counter::unix_ms;

/// A cached value with its freshness window. `fresh_until <= stale_until`;
/// an entry past `stale_until` is treated as absent.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fresh_until: u64,
    pub stale_until: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.fresh_until
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.stale_until
    }
}

/// Freshness windows applied on `set`.
#[derive(Debug, Clone, Copy)]
pub struct Ttl {
    pub fresh_ms: u64,
    pub stale_ms: u64,
}

impl Ttl {
    pub fn new(fresh_ms: u64, stale_ms: u64) -> Self {
        Self { fresh_ms, stale_ms }
    }
}

#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// One cache tier. Implementations are swappable at construction; the
/// canonical chain is `[process memory, optional shared store]`.
#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry<V>>, StoreError>;

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry<V>) -> Result<(), StoreError>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub enum CacheError {
    /// Every tier failed for the lookup. Individual tier failures are logged
    /// and skipped.
    AllTiersFailed,
    /// The origin loader failed; surfaced to the `swr` caller untouched.
    Origin(Arc<anyhow::Error>),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::AllTiersFailed => write!(f, "all cache tiers failed"),
            CacheError::Origin(e) => write!(f, "origin load failed: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

type Flight<V> = Arc<OnceCell<Result<V, Arc<anyhow::Error>>>>;

/// Ordered chain of cache tiers with stale-while-revalidate reads.
///
/// `swr` guarantees single-flight per key: concurrent callers needing the
/// same origin load share one in-flight fetch, on the synchronous miss path
/// and the background revalidation path alike. The flight entry is removed
/// on every exit path so a later miss starts a new fetch.
pub struct TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    tiers: Arc<Vec<Arc<dyn Store<V>>>>,
    flights: Arc<DashMap<String, Flight<V>>>,
}

impl<V> Clone for TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            tiers: Arc::clone(&self.tiers),
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(tiers: Vec<Arc<dyn Store<V>>>) -> Self {
        Self {
            tiers: Arc::new(tiers),
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Probe tiers in order. A hit in tier `i` backfills tiers `0..i` in the
    /// background and counts as a hit for the whole request.
    pub async fn get(&self, namespace: &'static str, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        let now = unix_ms();
        let mut any_ok = false;

        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.get(namespace, key).await {
                Ok(Some(entry)) if !entry.is_expired(now) => {
                    metrics::counter!(
                        "aegis_cache_hits_total",
                        "namespace" => namespace,
                        "tier" => tier.name(),
                    )
                    .increment(1);

                    if i > 0 {
                        self.backfill(i, namespace, key.to_string(), entry.clone());
                    }
                    return Ok(Some(entry));
                }
                Ok(_) => {
                    any_ok = true;
                }
                Err(e) => {
                    tracing::warn!(
                        "cache: tier get failed, tier={}, namespace={}, error={}",
                        tier.name(),
                        namespace,
                        e
                    );
                }
            }
        }

        if !any_ok {
            return Err(CacheError::AllTiersFailed);
        }
        metrics::counter!("aegis_cache_misses_total", "namespace" => namespace).increment(1);
        Ok(None)
    }

    /// Write to every tier concurrently. A tier failure is logged; the write
    /// counts as successful if any tier accepted it.
    pub async fn set(&self, namespace: &'static str, key: &str, value: V, ttl: Ttl) -> Result<(), CacheError> {
        let now = unix_ms();
        let entry = CacheEntry {
            value,
            fresh_until: now + ttl.fresh_ms,
            stale_until: now + ttl.stale_ms,
        };

        let mut joins = tokio::task::JoinSet::new();
        for tier in self.tiers.iter() {
            let tier = Arc::clone(tier);
            let key = key.to_string();
            let entry = entry.clone();
            joins.spawn(async move {
                let name = tier.name();
                (name, tier.set(namespace, &key, entry).await)
            });
        }

        let mut any_ok = false;
        while let Some(res) = joins.join_next().await {
            match res {
                Ok((_, Ok(()))) => any_ok = true,
                Ok((name, Err(e))) => {
                    tracing::warn!(
                        "cache: tier set failed, tier={}, namespace={}, error={}",
                        name,
                        namespace,
                        e
                    );
                }
                Err(e) => {
                    tracing::error!("cache: set task panicked: {}", e);
                }
            }
        }

        if any_ok {
            Ok(())
        } else {
            Err(CacheError::AllTiersFailed)
        }
    }

    /// Remove from every tier.
    pub async fn remove(&self, namespace: &'static str, key: &str) {
        for tier in self.tiers.iter() {
            if let Err(e) = tier.remove(namespace, key).await {
                tracing::warn!(
                    "cache: tier remove failed, tier={}, namespace={}, error={}",
                    tier.name(),
                    namespace,
                    e
                );
            }
        }
    }

    /// Stale-while-revalidate read.
    ///
    /// Fresh hit → returned as-is. Stale hit → returned immediately while a
    /// deduplicated background task refetches. Miss/expired → a deduplicated
    /// synchronous fetch runs, is written back, and is returned.
    pub async fn swr<F, Fut>(
        &self,
        namespace: &'static str,
        key: &str,
        ttl: Ttl,
        load: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let now = unix_ms();

        if let Some(entry) = self.get(namespace, key).await? {
            if entry.is_fresh(now) {
                return Ok(entry.value);
            }

            // Stale: serve it, refresh in the background.
            metrics::counter!("aegis_cache_revalidations_total", "namespace" => namespace)
                .increment(1);
            self.spawn_revalidate(namespace, key.to_string(), ttl, load());
            return Ok(entry.value);
        }

        let value = self.load_once(namespace, key, load()).await?;
        if let Err(e) = self.set(namespace, key, value.clone(), ttl).await {
            tracing::warn!(
                "cache: writeback after origin load failed, namespace={}, error={}",
                namespace,
                e
            );
        }
        Ok(value)
    }

    /// Run the origin load behind the per-key single-flight cell. Concurrent
    /// callers await the same future; the flight is cleared afterwards.
    async fn load_once<Fut>(&self, namespace: &'static str, key: &str, fut: Fut) -> Result<V, CacheError>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let flight_key = format!("{}/{}", namespace, key);
        let cell: Flight<V> = self
            .flights
            .entry(flight_key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| async {
                metrics::counter!("aegis_cache_origin_loads_total", "namespace" => namespace)
                    .increment(1);
                fut.await.map_err(Arc::new)
            })
            .await
            .clone();

        // Clear the flight so the next miss starts a new fetch. Errors are
        // not cached.
        self.flights.remove(&flight_key);

        result.map_err(CacheError::Origin)
    }

    fn spawn_revalidate<Fut>(&self, namespace: &'static str, key: String, ttl: Ttl, fut: Fut)
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            match cache.load_once(namespace, &key, fut).await {
                Ok(value) => {
                    if let Err(e) = cache.set(namespace, &key, value, ttl).await {
                        tracing::warn!(
                            "cache: revalidation writeback failed, namespace={}, error={}",
                            namespace,
                            e
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "cache: background revalidation failed, namespace={}, key={}, error={}",
                        namespace,
                        key,
                        e
                    );
                }
            }
        });
    }

    fn backfill(&self, upto: usize, namespace: &'static str, key: String, entry: CacheEntry<V>) {
        let tiers = Arc::clone(&self.tiers);
        tokio::spawn(async move {
            for tier in tiers.iter().take(upto) {
                if let Err(e) = tier.set(namespace, &key, entry.clone()).await {
                    tracing::warn!(
                        "cache: backfill failed, tier={}, namespace={}, error={}",
                        tier.name(),
                        namespace,
                        e
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn two_tier() -> (TieredCache<String>, Arc<MemoryStore<String>>, Arc<MemoryStore<String>>) {
        let local = Arc::new(MemoryStore::new(64, 0.0));
        let shared = Arc::new(MemoryStore::new(64, 0.0));
        let cache = TieredCache::new(vec![
            local.clone() as Arc<dyn Store<String>>,
            shared.clone() as Arc<dyn Store<String>>,
        ]);
        (cache, local, shared)
    }

    #[tokio::test]
    async fn test_swr_fresh_hit_skips_loader() {
        let (cache, _, _) = two_tier();
        let loads = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let loads = loads.clone();
            let v = cache
                .swr("ns", "k", Ttl::new(10_000, 60_000), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok("v1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(v, "v1");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_swr_stale_serves_old_value_and_revalidates() {
        let (cache, _, _) = two_tier();

        // fresh=0 makes the entry stale immediately but not expired.
        cache
            .set("ns", "k", "old".to_string(), Ttl::new(0, 60_000))
            .await
            .unwrap();

        let loads = Arc::new(AtomicU32::new(0));
        let l = loads.clone();
        let v = cache
            .swr("ns", "k", Ttl::new(10_000, 60_000), move || async move {
                l.fetch_add(1, Ordering::SeqCst);
                Ok("new".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "old");

        // Wait for the background revalidation to land.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if loads.load(Ordering::SeqCst) == 1 {
                break;
            }
        }
        let entry = cache.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(entry.value, "new");
    }

    #[tokio::test]
    async fn test_swr_single_flight_under_concurrency() {
        let (cache, _, _) = two_tier();
        let loads = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .swr("ns", "hot", Ttl::new(10_000, 60_000), move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("shared".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "shared");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_swr_loader_error_propagates_and_is_not_cached() {
        let (cache, _, _) = two_tier();

        let err = cache
            .swr("ns", "bad", Ttl::new(10_000, 60_000), || async {
                anyhow::bail!("origin down")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Origin(_)));

        // A later call retries the loader instead of replaying the failure.
        let v = cache
            .swr("ns", "bad", Ttl::new(10_000, 60_000), || async {
                Ok::<_, anyhow::Error>("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "recovered");
    }

    #[tokio::test]
    async fn test_get_backfills_earlier_tiers() {
        let (cache, local, shared) = two_tier();
        let now = unix_ms();

        shared
            .set(
                "ns",
                "k",
                CacheEntry {
                    value: "from-shared".to_string(),
                    fresh_until: now + 10_000,
                    stale_until: now + 60_000,
                },
            )
            .await
            .unwrap();

        let entry = cache.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(entry.value, "from-shared");

        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if local.get("ns", "k").await.unwrap().is_some() {
                break;
            }
        }
        assert!(local.get("ns", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_treated_as_absent() {
        let (cache, local, _) = two_tier();
        let now = unix_ms();

        local
            .set(
                "ns",
                "k",
                CacheEntry {
                    value: "dead".to_string(),
                    fresh_until: now.saturating_sub(2),
                    stale_until: now.saturating_sub(1),
                },
            )
            .await
            .unwrap();

        assert!(cache.get("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_clears_every_tier() {
        let (cache, local, shared) = two_tier();
        cache
            .set("ns", "k", "v".to_string(), Ttl::new(10_000, 60_000))
            .await
            .unwrap();
        cache.remove("ns", "k").await;
        assert!(local.get("ns", "k").await.unwrap().is_none());
        assert!(shared.get("ns", "k").await.unwrap().is_none());
    }
}
