pub mod matcher;
pub mod store;

pub use matcher::{select_override, wildcard_match};
pub use store::{MemoryPrimaryStore, NewOverride, OverridePage, PrimaryStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{MemoryStore, Store, TieredCache, Ttl};
use crate::config::CacheConfig;
use crate::error::GatewayError;

/// Named counter group inside a workspace (e.g. `email.send`). Immutable
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub created_at_ms: u64,
}

/// Where a policy's counters live: one global counter per identifier, or
/// one per edge location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharding {
    Edge,
    Global,
}

/// Stored policy that supersedes request-supplied limit parameters for an
/// identifier pattern (literal or `*` wildcard) within a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub id: String,
    pub namespace_id: String,
    pub identifier: String,
    pub limit: u64,
    pub duration_ms: u64,
    pub async_mode: bool,
    pub sharding: Option<Sharding>,
}

/// Limit parameters supplied on the request, used when no override matches.
#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    pub limit: u64,
    pub duration_ms: u64,
    pub async_mode: bool,
}

/// The parameters a `limit` call actually runs with.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub namespace_id: String,
    pub limit: u64,
    pub duration_ms: u64,
    pub async_mode: bool,
    pub sharding: Option<Sharding>,
    pub override_id: Option<String>,
}

const NAMESPACE_CACHE: &str = "rl_namespace";
const OVERRIDE_CACHE: &str = "rl_overrides";

/// Maps `(workspace, namespace, identifier)` to the effective policy.
///
/// Namespace records and override sets are read through the tiered cache
/// with stale-while-revalidate, so policy edits become effective on the next
/// revalidation (bounded by the stale window). The resolver itself is
/// deterministic: same namespace state + identifier → same answer.
#[derive(Clone)]
pub struct OverrideResolver {
    store: Arc<dyn PrimaryStore>,
    namespaces: TieredCache<Option<Namespace>>,
    overrides: TieredCache<Vec<RateLimitOverride>>,
    namespace_ttl: Ttl,
    override_ttl: Ttl,
    /// Concrete handles to the process-memory tiers, retained so bootstrap
    /// can run their periodic sweep.
    memory_tiers: (
        Arc<MemoryStore<Option<Namespace>>>,
        Arc<MemoryStore<Vec<RateLimitOverride>>>,
    ),
}

impl OverrideResolver {
    /// Build with the canonical tier chain: a process-memory tier in front
    /// of the primary store.
    pub fn new(store: Arc<dyn PrimaryStore>, cfg: &CacheConfig) -> Self {
        let ns_memory = Arc::new(MemoryStore::new(cfg.max_items, cfg.maintenance_frequency));
        let ov_memory = Arc::new(MemoryStore::new(cfg.max_items, cfg.maintenance_frequency));
        Self {
            store,
            namespaces: TieredCache::new(vec![
                ns_memory.clone() as Arc<dyn Store<Option<Namespace>>>
            ]),
            overrides: TieredCache::new(vec![
                ov_memory.clone() as Arc<dyn Store<Vec<RateLimitOverride>>>
            ]),
            namespace_ttl: Ttl::new(cfg.namespace_fresh_ms, cfg.namespace_stale_ms),
            override_ttl: Ttl::new(cfg.override_fresh_ms, cfg.override_stale_ms),
            memory_tiers: (ns_memory, ov_memory),
        }
    }

    /// Spawn the periodic sweep for the process-memory tiers. Call once
    /// from bootstrap.
    pub fn start_cache_sweeps(
        &self,
        interval: std::time::Duration,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        self.memory_tiers.0.start_sweep(interval, shutdown.clone());
        self.memory_tiers.1.start_sweep(interval, shutdown);
    }

    /// Resolve the effective policy for one `limit` call.
    pub async fn resolve(
        &self,
        workspace_id: &str,
        namespace_name: &str,
        identifier: &str,
        defaults: RequestPolicy,
        can_create_namespace: bool,
    ) -> Result<ResolvedPolicy, GatewayError> {
        let namespace = self
            .resolve_namespace(workspace_id, namespace_name, can_create_namespace)
            .await?;

        let overrides = self.cached_overrides(&namespace.id).await?;

        match select_override(&overrides, identifier) {
            Some(ov) => {
                metrics::counter!("aegis_override_hits_total").increment(1);
                Ok(ResolvedPolicy {
                    namespace_id: namespace.id,
                    limit: ov.limit,
                    duration_ms: ov.duration_ms,
                    async_mode: ov.async_mode,
                    sharding: ov.sharding,
                    override_id: Some(ov.id.clone()),
                })
            }
            None => Ok(ResolvedPolicy {
                namespace_id: namespace.id,
                limit: defaults.limit,
                duration_ms: defaults.duration_ms,
                async_mode: defaults.async_mode,
                sharding: None,
                override_id: None,
            }),
        }
    }

    /// Fetch the namespace through the cache, auto-creating it when the
    /// caller is allowed to.
    pub async fn resolve_namespace(
        &self,
        workspace_id: &str,
        name: &str,
        can_create: bool,
    ) -> Result<Namespace, GatewayError> {
        let cache_key = format!("{}/{}", workspace_id, name);

        let store = Arc::clone(&self.store);
        let ws = workspace_id.to_string();
        let n = name.to_string();
        let cached = self
            .namespaces
            .swr(NAMESPACE_CACHE, &cache_key, self.namespace_ttl, move || {
                async move {
                    store
                        .namespace_by_name(&ws, &n)
                        .await
                        .map_err(|e| anyhow::anyhow!("{}", e))
                }
            })
            .await
            .map_err(|e| GatewayError::Cache(e.to_string()))?;

        if let Some(ns) = cached {
            return Ok(ns);
        }

        if !can_create {
            return Err(GatewayError::NamespaceNotFound(name.to_string()));
        }

        let ns = self.store.create_namespace(workspace_id, name).await?;
        metrics::counter!("aegis_namespace_autocreate_total").increment(1);
        tracing::info!(
            "overrides: namespace auto-created, workspace={}, name={}, id={}",
            workspace_id,
            name,
            ns.id
        );

        // Replace the cached miss so concurrent callers see the new row.
        if let Err(e) = self
            .namespaces
            .set(NAMESPACE_CACHE, &cache_key, Some(ns.clone()), self.namespace_ttl)
            .await
        {
            tracing::warn!("overrides: namespace cache set failed: {}", e);
        }

        Ok(ns)
    }

    /// Drop cached state for a namespace after an override mutation, so the
    /// next call observes the edit without waiting out the stale window.
    pub async fn invalidate_namespace(&self, namespace_id: &str) {
        self.overrides.remove(OVERRIDE_CACHE, namespace_id).await;
    }

    pub fn primary_store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    async fn cached_overrides(
        &self,
        namespace_id: &str,
    ) -> Result<Vec<RateLimitOverride>, GatewayError> {
        let store = Arc::clone(&self.store);
        let ns_id = namespace_id.to_string();
        self.overrides
            .swr(OVERRIDE_CACHE, namespace_id, self.override_ttl, move || {
                async move {
                    store
                        .overrides_for_namespace(&ns_id)
                        .await
                        .map_err(|e| anyhow::anyhow!("{}", e))
                }
            })
            .await
            .map_err(|e| GatewayError::Cache(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::store::NewOverride;

    fn defaults() -> RequestPolicy {
        RequestPolicy {
            limit: 50,
            duration_ms: 60_000,
            async_mode: false,
        }
    }

    fn resolver() -> (OverrideResolver, Arc<MemoryPrimaryStore>) {
        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = OverrideResolver::new(store.clone(), &CacheConfig::default());
        (resolver, store)
    }

    #[tokio::test]
    async fn test_missing_namespace_without_permission() {
        let (resolver, _) = resolver();
        let err = resolver
            .resolve("ws_1", "email.send", "u1", defaults(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_autocreate_namespace_with_permission() {
        let (resolver, store) = resolver();
        let policy = resolver
            .resolve("ws_1", "email.send", "u1", defaults(), true)
            .await
            .unwrap();
        assert_eq!(policy.limit, 50);
        assert!(policy.override_id.is_none());

        let ns = store
            .namespace_by_name("ws_1", "email.send")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ns.id, policy.namespace_id);
    }

    #[tokio::test]
    async fn test_concurrent_autocreate_converges_on_one_row() {
        let (resolver, store) = resolver();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move {
                r.resolve("ws_1", "burst.ns", "u", defaults(), true)
                    .await
                    .unwrap()
                    .namespace_id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let ns = store
            .namespace_by_name("ws_1", "burst.ns")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ns.id, ids[0]);
    }

    #[tokio::test]
    async fn test_override_wins_over_request_defaults() {
        let (resolver, store) = resolver();
        let ns = store.create_namespace("ws_1", "api").await.unwrap();
        store
            .upsert_override(NewOverride {
                namespace_id: ns.id.clone(),
                identifier: "*@acme.com".to_string(),
                limit: 100,
                duration_ms: 30_000,
                async_mode: true,
                sharding: Some(Sharding::Global),
            })
            .await
            .unwrap();

        let policy = resolver
            .resolve("ws_1", "api", "eng@acme.com", defaults(), false)
            .await
            .unwrap();
        assert_eq!(policy.limit, 100);
        assert_eq!(policy.duration_ms, 30_000);
        assert!(policy.async_mode);
        assert!(policy.override_id.is_some());

        let fallback = resolver
            .resolve("ws_1", "api", "eng@other.com", defaults(), false)
            .await
            .unwrap();
        assert_eq!(fallback.limit, 50);
        assert!(fallback.override_id.is_none());
    }

    #[tokio::test]
    async fn test_exact_beats_wildcard_through_resolver() {
        let (resolver, store) = resolver();
        let ns = store.create_namespace("ws_1", "api").await.unwrap();
        for (pattern, limit) in [("*@acme.com", 100u64), ("ceo@acme.com", 10u64)] {
            store
                .upsert_override(NewOverride {
                    namespace_id: ns.id.clone(),
                    identifier: pattern.to_string(),
                    limit,
                    duration_ms: 60_000,
                    async_mode: false,
                    sharding: None,
                })
                .await
                .unwrap();
        }

        let ceo = resolver
            .resolve("ws_1", "api", "ceo@acme.com", defaults(), false)
            .await
            .unwrap();
        assert_eq!(ceo.limit, 10);
    }

    #[tokio::test]
    async fn test_invalidate_makes_edit_visible_immediately() {
        let (resolver, store) = resolver();
        let ns = store.create_namespace("ws_1", "api").await.unwrap();

        // Warm the override cache with the empty set.
        let before = resolver
            .resolve("ws_1", "api", "u1", defaults(), false)
            .await
            .unwrap();
        assert!(before.override_id.is_none());

        store
            .upsert_override(NewOverride {
                namespace_id: ns.id.clone(),
                identifier: "u1".to_string(),
                limit: 5,
                duration_ms: 60_000,
                async_mode: false,
                sharding: None,
            })
            .await
            .unwrap();
        resolver.invalidate_namespace(&ns.id).await;

        let after = resolver
            .resolve("ws_1", "api", "u1", defaults(), false)
            .await
            .unwrap();
        assert_eq!(after.limit, 5);
    }
}
