use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use super::{Namespace, RateLimitOverride, Sharding};
use crate::counter::unix_ms;
use crate::error::GatewayError;

/// Capability surface of the primary (relational) store for namespaces and
/// overrides. Counters are never persisted; this trait covers only the
/// durable policy state. Implementations are swappable at construction.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn namespace_by_name(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<Namespace>, GatewayError>;

    async fn namespace_by_id(&self, namespace_id: &str)
        -> Result<Option<Namespace>, GatewayError>;

    /// Duplicate-key-safe insert: concurrent creates for the same
    /// `(workspace_id, name)` converge on the surviving row.
    async fn create_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Namespace, GatewayError>;

    async fn overrides_for_namespace(
        &self,
        namespace_id: &str,
    ) -> Result<Vec<RateLimitOverride>, GatewayError>;

    async fn get_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<Option<RateLimitOverride>, GatewayError>;

    /// Insert or replace the override for `(namespace_id, identifier)`.
    async fn upsert_override(&self, new: NewOverride) -> Result<RateLimitOverride, GatewayError>;

    /// Soft delete. Returns false when no live row matched.
    async fn delete_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<bool, GatewayError>;

    /// Cursor-paginated listing ordered by identifier.
    async fn list_overrides(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<OverridePage, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct NewOverride {
    pub namespace_id: String,
    pub identifier: String,
    pub limit: u64,
    pub duration_ms: u64,
    pub async_mode: bool,
    pub sharding: Option<Sharding>,
}

#[derive(Debug, Clone)]
pub struct OverridePage {
    pub overrides: Vec<RateLimitOverride>,
    /// Opaque cursor for the next page; `None` when the listing is complete.
    pub cursor: Option<String>,
}

pub fn generate_id(prefix: &str) -> String {
    format!("{}_{:016x}", prefix, rand::random::<u64>())
}

/// In-memory primary store for standalone nodes and tests. Enforces the
/// same uniqueness the relational schema does: `(workspace_id, name)` on
/// namespaces and `(namespace_id, identifier)` on overrides, both over
/// non-deleted rows.
pub struct MemoryPrimaryStore {
    /// `workspace_id/name` → namespace.
    namespaces: DashMap<String, Namespace>,
    /// `namespace_id` → identifier-ordered override rows. The `BTreeMap`
    /// gives cursor pagination a stable order.
    overrides: DashMap<String, Mutex<BTreeMap<String, OverrideRow>>>,
}

/// Stored override plus its tombstone. Deleted rows stay in place (the
/// relational schema keeps them for audit) and are invisible to every
/// read; re-creating the identifier starts a new row with a new id.
struct OverrideRow {
    row: RateLimitOverride,
    deleted: bool,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
            overrides: DashMap::new(),
        }
    }

    fn namespace_key(workspace_id: &str, name: &str) -> String {
        format!("{}/{}", workspace_id, name)
    }
}

impl Default for MemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn namespace_by_name(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<Namespace>, GatewayError> {
        Ok(self
            .namespaces
            .get(&Self::namespace_key(workspace_id, name))
            .map(|r| r.value().clone()))
    }

    async fn namespace_by_id(
        &self,
        namespace_id: &str,
    ) -> Result<Option<Namespace>, GatewayError> {
        Ok(self
            .namespaces
            .iter()
            .find(|r| r.value().id == namespace_id)
            .map(|r| r.value().clone()))
    }

    async fn create_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Namespace, GatewayError> {
        // The entry API is the duplicate-key-safe insert: the losing writer
        // reads the winner's row instead of erroring.
        let ns = self
            .namespaces
            .entry(Self::namespace_key(workspace_id, name))
            .or_insert_with(|| Namespace {
                id: generate_id("ns"),
                workspace_id: workspace_id.to_string(),
                name: name.to_string(),
                created_at_ms: unix_ms(),
            })
            .value()
            .clone();
        Ok(ns)
    }

    async fn overrides_for_namespace(
        &self,
        namespace_id: &str,
    ) -> Result<Vec<RateLimitOverride>, GatewayError> {
        Ok(self
            .overrides
            .get(namespace_id)
            .map(|rows| {
                rows.lock()
                    .unwrap()
                    .values()
                    .filter(|r| !r.deleted)
                    .map(|r| r.row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<Option<RateLimitOverride>, GatewayError> {
        Ok(self.overrides.get(namespace_id).and_then(|rows| {
            rows.lock()
                .unwrap()
                .get(identifier)
                .filter(|r| !r.deleted)
                .map(|r| r.row.clone())
        }))
    }

    async fn upsert_override(&self, new: NewOverride) -> Result<RateLimitOverride, GatewayError> {
        let rows = self
            .overrides
            .entry(new.namespace_id.clone())
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut rows = rows.lock().unwrap();

        // Only a live row keeps its id; writing over a tombstone is a new
        // row, as the unique index covers non-deleted rows only.
        let id = match rows.get(&new.identifier) {
            Some(existing) if !existing.deleted => existing.row.id.clone(),
            _ => generate_id("ovr"),
        };

        let row = RateLimitOverride {
            id,
            namespace_id: new.namespace_id,
            identifier: new.identifier.clone(),
            limit: new.limit,
            duration_ms: new.duration_ms,
            async_mode: new.async_mode,
            sharding: new.sharding,
        };
        rows.insert(
            new.identifier,
            OverrideRow {
                row: row.clone(),
                deleted: false,
            },
        );
        Ok(row)
    }

    async fn delete_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<bool, GatewayError> {
        let Some(rows) = self.overrides.get(namespace_id) else {
            return Ok(false);
        };
        let mut rows = rows.lock().unwrap();
        match rows.get_mut(identifier) {
            Some(r) if !r.deleted => {
                r.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_overrides(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<OverridePage, GatewayError> {
        let page_size = page_size.max(1);
        let Some(rows) = self.overrides.get(namespace_id) else {
            return Ok(OverridePage {
                overrides: Vec::new(),
                cursor: None,
            });
        };
        let rows = rows.lock().unwrap();

        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Unbounded,
        };

        let mut page: Vec<RateLimitOverride> = rows
            .range((lower, Bound::Unbounded))
            .filter(|(_, r)| !r.deleted)
            .take(page_size + 1)
            .map(|(_, r)| r.row.clone())
            .collect();

        let next = if page.len() > page_size {
            page.truncate(page_size);
            page.last().map(|o| o.identifier.clone())
        } else {
            None
        };

        Ok(OverridePage {
            overrides: page,
            cursor: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_override(ns: &str, identifier: &str, limit: u64) -> NewOverride {
        NewOverride {
            namespace_id: ns.to_string(),
            identifier: identifier.to_string(),
            limit,
            duration_ms: 60_000,
            async_mode: false,
            sharding: None,
        }
    }

    #[tokio::test]
    async fn test_create_namespace_is_duplicate_safe() {
        let store = MemoryPrimaryStore::new();
        let a = store.create_namespace("ws_1", "email.send").await.unwrap();
        let b = store.create_namespace("ws_1", "email.send").await.unwrap();
        assert_eq!(a.id, b.id);

        let other_ws = store.create_namespace("ws_2", "email.send").await.unwrap();
        assert_ne!(a.id, other_ws.id);
    }

    #[tokio::test]
    async fn test_namespace_lookup() {
        let store = MemoryPrimaryStore::new();
        assert!(store
            .namespace_by_name("ws_1", "missing")
            .await
            .unwrap()
            .is_none());
        let ns = store.create_namespace("ws_1", "api.calls").await.unwrap();
        let found = store
            .namespace_by_name("ws_1", "api.calls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, ns.id);
    }

    #[tokio::test]
    async fn test_override_upsert_keeps_id() {
        let store = MemoryPrimaryStore::new();
        let a = store
            .upsert_override(new_override("ns_1", "ceo@acme.com", 10))
            .await
            .unwrap();
        let b = store
            .upsert_override(new_override("ns_1", "ceo@acme.com", 20))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.limit, 20);

        let got = store
            .get_override("ns_1", "ceo@acme.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.limit, 20);
    }

    #[tokio::test]
    async fn test_delete_then_get_returns_none() {
        let store = MemoryPrimaryStore::new();
        store
            .upsert_override(new_override("ns_1", "x", 10))
            .await
            .unwrap();
        assert!(store.delete_override("ns_1", "x").await.unwrap());
        assert!(!store.delete_override("ns_1", "x").await.unwrap());
        assert!(store.get_override("ns_1", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_after_delete_starts_a_new_row() {
        let store = MemoryPrimaryStore::new();
        let first = store
            .upsert_override(new_override("ns_1", "x", 10))
            .await
            .unwrap();
        assert!(store.delete_override("ns_1", "x").await.unwrap());

        let second = store
            .upsert_override(new_override("ns_1", "x", 20))
            .await
            .unwrap();
        assert_ne!(first.id, second.id, "tombstoned row must not lend its id");
        assert_eq!(
            store.get_override("ns_1", "x").await.unwrap().unwrap().limit,
            20
        );
    }

    #[tokio::test]
    async fn test_deleted_rows_invisible_to_namespace_reads() {
        let store = MemoryPrimaryStore::new();
        store
            .upsert_override(new_override("ns_1", "keep", 10))
            .await
            .unwrap();
        store
            .upsert_override(new_override("ns_1", "drop", 10))
            .await
            .unwrap();
        store.delete_override("ns_1", "drop").await.unwrap();

        let live = store.overrides_for_namespace("ns_1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].identifier, "keep");
    }

    #[tokio::test]
    async fn test_list_skips_tombstones() {
        let store = MemoryPrimaryStore::new();
        for i in 0..6 {
            store
                .upsert_override(new_override("ns_1", &format!("id-{}", i), i))
                .await
                .unwrap();
        }
        store.delete_override("ns_1", "id-1").await.unwrap();
        store.delete_override("ns_1", "id-4").await.unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_overrides("ns_1", cursor.as_deref(), 2)
                .await
                .unwrap();
            seen.extend(page.overrides.iter().map(|o| o.identifier.clone()));
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, vec!["id-0", "id-2", "id-3", "id-5"]);
    }

    #[tokio::test]
    async fn test_list_paginates_without_duplicates() {
        let store = MemoryPrimaryStore::new();
        for i in 0..7 {
            store
                .upsert_override(new_override("ns_1", &format!("id-{}", i), i))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_overrides("ns_1", cursor.as_deref(), 3)
                .await
                .unwrap();
            assert!(page.overrides.len() <= 3);
            seen.extend(page.overrides.iter().map(|o| o.identifier.clone()));
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        assert_eq!(seen.len(), 7);
        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(dedup, seen);
    }

    #[tokio::test]
    async fn test_list_empty_namespace() {
        let store = MemoryPrimaryStore::new();
        let page = store.list_overrides("ns_none", None, 10).await.unwrap();
        assert!(page.overrides.is_empty());
        assert!(page.cursor.is_none());
    }
}
