pub mod batch;
pub mod breaker;

pub use batch::{DeltaBatcher, PendingDelta};
pub use breaker::{BreakerCheck, OriginBreakers};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::cluster::{
    BroadcastExceededRequest, Member, Membership, PushCounterRequest, PushCounterResponse,
    RpcClient, RpcService,
};
use crate::config::LimiterConfig;
use crate::counter::{unix_ms, CounterStore, Decision};
use crate::error::GatewayError;
use crate::overrides::{OverrideResolver, RequestPolicy, ResolvedPolicy, Sharding};

/// One rate-limit check, post-validation.
#[derive(Debug, Clone)]
pub struct LimitRequest {
    pub workspace_id: String,
    pub namespace: String,
    pub identifier: String,
    pub limit: u64,
    pub duration_ms: u64,
    pub cost: u64,
    pub async_mode: bool,
}

#[derive(Debug, Clone)]
pub struct LimitOutcome {
    pub passed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub override_id: Option<String>,
}

struct DedupeEntry {
    resp: PushCounterResponse,
    expires_at_ms: u64,
}

/// Replayed push responses are retained up to this many entries before an
/// expiry sweep runs.
const DEDUPE_SWEEP_THRESHOLD: usize = 65_536;

/// The hot-path orchestrator.
///
/// Each call resolves the effective policy, snapshots the ring exactly once,
/// computes the local sliding-window decision, and converges to the owning
/// node — asynchronously through the delta batcher on the low-latency path,
/// synchronously when the caller asked for the owner's decision. Owners that
/// keep failing are circuit-broken and the local shadow counter becomes
/// authoritative until cooldown.
pub struct Limiter {
    counters: Arc<CounterStore>,
    resolver: OverrideResolver,
    membership: Arc<Membership>,
    rpc: RpcClient,
    batcher: Arc<DeltaBatcher>,
    breakers: OriginBreakers,
    cfg: LimiterConfig,
    edge_tag: String,
    dedupe: DashMap<String, DedupeEntry>,
}

impl Limiter {
    pub fn new(
        counters: Arc<CounterStore>,
        resolver: OverrideResolver,
        membership: Arc<Membership>,
        cfg: LimiterConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let rpc = RpcClient::new(std::time::Duration::from_millis(cfg.rpc_timeout_ms))?;
        let batcher = Arc::new(DeltaBatcher::new(cfg.batch_capacity, cfg.batch_max_bytes));
        let edge_tag = cfg
            .edge_tag
            .clone()
            .unwrap_or_else(|| membership.local().node_id.clone());

        Ok(Arc::new(Self {
            counters,
            resolver,
            membership,
            rpc,
            batcher,
            breakers: OriginBreakers::new(),
            cfg,
            edge_tag,
            dedupe: DashMap::new(),
        }))
    }

    pub fn batcher(&self) -> &Arc<DeltaBatcher> {
        &self.batcher
    }

    pub fn resolver(&self) -> &OverrideResolver {
        &self.resolver
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    pub fn breakers(&self) -> &OriginBreakers {
        &self.breakers
    }

    /// The `ratelimit.limit` operation.
    pub async fn limit(
        &self,
        req: &LimitRequest,
        can_create_namespace: bool,
    ) -> Result<LimitOutcome, GatewayError> {
        let start = Instant::now();

        let policy = self
            .resolver
            .resolve(
                &req.workspace_id,
                &req.namespace,
                &req.identifier,
                RequestPolicy {
                    limit: req.limit,
                    duration_ms: req.duration_ms,
                    async_mode: req.async_mode,
                },
                can_create_namespace,
            )
            .await?;

        // Edge-sharded policies get a per-edge counter: the tag folds into
        // the identifier before hashing and counting.
        let identifier = match policy.sharding {
            Some(Sharding::Edge) => format!("{}:{}", self.edge_tag, req.identifier),
            _ => req.identifier.clone(),
        };

        let counter_key = counter_key(
            &policy.namespace_id,
            &identifier,
            policy.limit,
            policy.duration_ms,
        );
        let ownership_key = format!("{}:{}", policy.namespace_id, identifier);

        // One ring snapshot per call; membership churn never retargets a
        // call in flight.
        let ring = self.membership.ring();
        let owner = ring.owner(&ownership_key).cloned();
        let is_owner = owner
            .as_ref()
            .map(|o| o.node_id == self.membership.local().node_id)
            .unwrap_or(true);

        let now = unix_ms();
        let local = self.counters.apply(
            &counter_key,
            policy.limit,
            policy.duration_ms,
            req.cost,
            now,
        );

        let outcome = if is_owner {
            if local.remaining == 0 && req.cost > 0 {
                self.maybe_broadcast(
                    &policy.namespace_id,
                    &identifier,
                    &counter_key,
                    policy.limit,
                    policy.duration_ms,
                    local.reset_at_ms,
                );
            }
            outcome_of(local, &policy)
        } else if policy.async_mode {
            // Low-latency path: answer locally, converge in the background.
            if local.passed && req.cost > 0 {
                self.batcher.enqueue(
                    &owner.as_ref().expect("non-owner implies owner").node_id,
                    PendingDelta {
                        namespace_id: policy.namespace_id.clone(),
                        identifier: identifier.clone(),
                        counter_key: counter_key.clone(),
                        delta: req.cost,
                        window_start_ms: local.reset_at_ms - policy.duration_ms,
                        limit: policy.limit,
                        duration_ms: policy.duration_ms,
                    },
                );
            }
            outcome_of(local, &policy)
        } else {
            self.sync_with_owner(
                owner.expect("non-owner implies owner"),
                &policy,
                &identifier,
                req.cost,
                local,
                now,
            )
            .await?
        };

        metrics::counter!(
            "aegis_limit_decisions_total",
            "outcome" => if outcome.passed { "passed" } else { "denied" },
            "mode" => if policy.async_mode { "async" } else { "sync" },
        )
        .increment(1);
        metrics::histogram!("aegis_limit_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        Ok(outcome)
    }

    /// Consistency path: the owner's decision wins. The local counter was
    /// already updated best-effort for subsequent shadow decisions.
    async fn sync_with_owner(
        &self,
        owner: Member,
        policy: &ResolvedPolicy,
        identifier: &str,
        cost: u64,
        local: Decision,
        now: u64,
    ) -> Result<LimitOutcome, GatewayError> {
        // An active exceeded pin is decisive; the owner already told us.
        if local.pinned {
            return Ok(outcome_of(local, policy));
        }

        if let BreakerCheck::Rejected = self.breakers.check(&owner.node_id, &self.cfg.breaker) {
            // Open breaker: shadow is authoritative until cooldown.
            metrics::counter!(
                "aegis_origin_local_fallback_total",
                "reason" => "breaker_open",
            )
            .increment(1);
            return Ok(outcome_of(local, policy));
        }

        let push = PushCounterRequest {
            request_id: generate_request_id(),
            namespace_id: policy.namespace_id.clone(),
            identifier: identifier.to_string(),
            delta: cost,
            window_start_ms: window_start(now, policy.duration_ms),
            limit: policy.limit,
            duration_ms: policy.duration_ms,
            granted: false,
        };

        match self.rpc.push_counter(&owner, &push).await {
            Ok(resp) => {
                self.breakers.record_success(&owner.node_id, &self.cfg.breaker);
                Ok(LimitOutcome {
                    passed: resp.passed,
                    limit: policy.limit,
                    remaining: policy.limit.saturating_sub(resp.current),
                    reset_at_ms: resp.reset_at_ms,
                    override_id: policy.override_id.clone(),
                })
            }
            Err(e) => {
                self.breakers.record_failure(&owner.node_id, &self.cfg.breaker);
                metrics::counter!(
                    "aegis_origin_local_fallback_total",
                    "reason" => "push_failed",
                )
                .increment(1);
                tracing::warn!(
                    "limiter: sync push failed, owner={}, error={}",
                    owner.node_id,
                    e
                );

                // A peek carries no cost; answer from the shadow instead of
                // erroring.
                if cost == 0 {
                    return Ok(outcome_of(local, policy));
                }
                Err(GatewayError::OriginUnavailable(owner.node_id))
            }
        }
    }

    /// Drain the per-owner batches and push them to their owners. Called by
    /// the background flusher on its interval or byte-cap wake.
    ///
    /// Ownership is re-resolved against the current ring here: deltas that
    /// were queued for a node that has since left converge to the new owner
    /// (or merge locally when ownership moved to us).
    pub async fn flush_once(&self) {
        let deltas = self.batcher.drain_all();
        if deltas.is_empty() {
            return;
        }

        let ring = self.membership.ring();
        let self_id = self.membership.local().node_id.clone();
        let now = unix_ms();

        let mut by_owner: HashMap<String, (Member, Vec<PendingDelta>)> = HashMap::new();
        for d in deltas {
            let ownership_key = format!("{}:{}", d.namespace_id, d.identifier);
            match ring.owner(&ownership_key) {
                Some(o) if o.node_id != self_id => {
                    by_owner
                        .entry(o.node_id.clone())
                        .or_insert_with(|| (o.clone(), Vec::new()))
                        .1
                        .push(d);
                }
                _ => {
                    // Ownership is (or became) ours: merge directly.
                    let merged = self.counters.merge_granted(
                        &d.counter_key,
                        d.delta,
                        d.window_start_ms,
                        d.limit,
                        d.duration_ms,
                        now,
                    );
                    if merged.exceeded {
                        self.maybe_broadcast(
                            &d.namespace_id,
                            &d.identifier,
                            &d.counter_key,
                            d.limit,
                            d.duration_ms,
                            merged.reset_at_ms,
                        );
                    }
                }
            }
        }

        for (owner_id, (owner, batch)) in by_owner {
            if let BreakerCheck::Rejected = self.breakers.check(&owner_id, &self.cfg.breaker) {
                metrics::counter!(
                    "aegis_origin_local_fallback_total",
                    "reason" => "breaker_open",
                )
                .increment(1);
                self.batcher.requeue(&owner_id, batch);
                continue;
            }

            let mut iter = batch.into_iter();
            let mut failed: Vec<PendingDelta> = Vec::new();

            for d in iter.by_ref() {
                let push = PushCounterRequest {
                    request_id: generate_request_id(),
                    namespace_id: d.namespace_id.clone(),
                    identifier: d.identifier.clone(),
                    delta: d.delta,
                    window_start_ms: d.window_start_ms,
                    limit: d.limit,
                    duration_ms: d.duration_ms,
                    granted: true,
                };
                match self.rpc.push_counter(&owner, &push).await {
                    Ok(resp) => {
                        self.breakers.record_success(&owner_id, &self.cfg.breaker);
                        if !resp.passed {
                            // Owner reports the window consumed; pin the
                            // shadow ahead of the broadcast.
                            self.counters.pin_exceeded(
                                &d.counter_key,
                                resp.reset_at_ms,
                                d.duration_ms,
                                unix_ms(),
                            );
                        }
                    }
                    Err(e) => {
                        self.breakers.record_failure(&owner_id, &self.cfg.breaker);
                        tracing::warn!(
                            "limiter: batch push failed, owner={}, error={}",
                            owner_id,
                            e
                        );
                        failed.push(d);
                        break;
                    }
                }
            }
            // Whatever the loop did not reach rides back onto the queue.
            failed.extend(iter);

            if !failed.is_empty() {
                metrics::counter!("aegis_push_requeued_total").increment(failed.len() as u64);
                self.batcher.requeue(&owner_id, failed);
            }
        }
    }

    /// Fan the exceeded notification out to all alive peers. At most one
    /// broadcast per counter per window.
    fn maybe_broadcast(
        &self,
        namespace_id: &str,
        identifier: &str,
        counter_key: &str,
        limit: u64,
        duration_ms: u64,
        reset_at_ms: u64,
    ) {
        let window_start_ms = reset_at_ms.saturating_sub(duration_ms);
        if !self
            .counters
            .claim_broadcast(counter_key, window_start_ms, duration_ms)
        {
            return;
        }

        let peers = self.membership.alive_peers();
        if peers.is_empty() {
            return;
        }

        let req = BroadcastExceededRequest {
            namespace_id: namespace_id.to_string(),
            identifier: identifier.to_string(),
            limit,
            window_start_ms,
            reset_at_ms,
        };
        let rpc = self.rpc.clone();

        tokio::spawn(async move {
            metrics::counter!("aegis_broadcast_fanout_total").increment(1);
            for peer in peers {
                if let Err(e) = rpc.broadcast_exceeded(&peer, &req).await {
                    tracing::debug!(
                        "limiter: exceeded broadcast failed, peer={}, error={}",
                        peer.node_id,
                        e
                    );
                }
            }
        });
    }

    fn sweep_dedupe(&self, now: u64) {
        if self.dedupe.len() > DEDUPE_SWEEP_THRESHOLD {
            self.dedupe.retain(|_, e| e.expires_at_ms > now);
        }
    }
}

#[async_trait]
impl RpcService for Limiter {
    async fn push_counter(&self, req: PushCounterRequest) -> PushCounterResponse {
        let now = unix_ms();

        // Idempotence under retries: replay the original response within
        // the dedupe window.
        if let Some(hit) = self.dedupe.get(&req.request_id) {
            if hit.expires_at_ms > now {
                metrics::counter!("aegis_push_deduped_total").increment(1);
                return hit.resp;
            }
        }

        let key = counter_key(&req.namespace_id, &req.identifier, req.limit, req.duration_ms);

        let resp = if req.granted {
            let merged = self.counters.merge_granted(
                &key,
                req.delta,
                req.window_start_ms,
                req.limit,
                req.duration_ms,
                now,
            );
            if merged.exceeded {
                self.maybe_broadcast(
                    &req.namespace_id,
                    &req.identifier,
                    &key,
                    req.limit,
                    req.duration_ms,
                    merged.reset_at_ms,
                );
            }
            PushCounterResponse {
                current: merged.current,
                passed: !merged.exceeded,
                reset_at_ms: merged.reset_at_ms,
            }
        } else {
            let decision = self
                .counters
                .apply(&key, req.limit, req.duration_ms, req.delta, now);
            if decision.remaining == 0 && req.delta > 0 {
                self.maybe_broadcast(
                    &req.namespace_id,
                    &req.identifier,
                    &key,
                    req.limit,
                    req.duration_ms,
                    decision.reset_at_ms,
                );
            }
            PushCounterResponse {
                current: decision.effective,
                passed: decision.passed,
                reset_at_ms: decision.reset_at_ms,
            }
        };

        self.dedupe.insert(
            req.request_id,
            DedupeEntry {
                resp,
                expires_at_ms: now + req.duration_ms.saturating_mul(2),
            },
        );
        self.sweep_dedupe(now);

        resp
    }

    async fn broadcast_exceeded(&self, req: BroadcastExceededRequest) {
        let duration_ms = req.reset_at_ms.saturating_sub(req.window_start_ms);
        let key = counter_key(&req.namespace_id, &req.identifier, req.limit, duration_ms);
        self.counters
            .pin_exceeded(&key, req.reset_at_ms, duration_ms, unix_ms());
        metrics::counter!("aegis_broadcast_received_total").increment(1);
    }
}

fn counter_key(namespace_id: &str, identifier: &str, limit: u64, duration_ms: u64) -> String {
    format!("{}:{}:{}:{}", namespace_id, identifier, limit, duration_ms)
}

fn window_start(now_ms: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        return now_ms;
    }
    (now_ms / duration_ms) * duration_ms
}

fn outcome_of(decision: Decision, policy: &ResolvedPolicy) -> LimitOutcome {
    LimitOutcome {
        passed: decision.passed,
        limit: policy.limit,
        remaining: decision.remaining,
        reset_at_ms: decision.reset_at_ms,
        override_id: policy.override_id.clone(),
    }
}

fn generate_request_id() -> String {
    format!("push_{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MembershipConfig;
    use crate::config::CacheConfig;
    use crate::overrides::{MemoryPrimaryStore, NewOverride, PrimaryStore};

    fn local_member(id: &str) -> Member {
        Member {
            node_id: id.to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            rpc_port: 1,
            gossip_port: 2,
            joined_at_ms: 0,
        }
    }

    fn membership_cfg() -> MembershipConfig {
        MembershipConfig {
            probe_interval_ms: 60_000,
            probe_timeout_ms: 1_000,
            suspect_timeout_ms: 300_000,
            fanout: 1,
            vnodes: 64,
        }
    }

    struct Fixture {
        limiter: Arc<Limiter>,
        store: Arc<MemoryPrimaryStore>,
        membership: Arc<Membership>,
    }

    fn standalone() -> Fixture {
        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = OverrideResolver::new(store.clone(), &CacheConfig::default());
        let membership = Membership::detached(local_member("node-a"), membership_cfg());
        let counters = Arc::new(CounterStore::new());
        let limiter = Limiter::new(
            counters,
            resolver,
            membership.clone(),
            LimiterConfig::default(),
        )
        .unwrap();
        Fixture {
            limiter,
            store,
            membership,
        }
    }

    fn limit_request(identifier: &str, limit: u64, cost: u64, async_mode: bool) -> LimitRequest {
        LimitRequest {
            workspace_id: "ws_1".to_string(),
            namespace: "email.send".to_string(),
            identifier: identifier.to_string(),
            limit,
            duration_ms: 60_000,
            cost,
            async_mode,
        }
    }

    #[tokio::test]
    async fn test_burst_within_one_window_standalone() {
        let f = standalone();

        for i in 0..10 {
            let out = f
                .limiter
                .limit(&limit_request("u1", 10, 1, false), true)
                .await
                .unwrap();
            assert!(out.passed, "call {} should pass", i);
            assert_eq!(out.remaining, 9 - i as u64);
            assert_eq!(out.limit, 10);
        }
        for _ in 0..2 {
            let out = f
                .limiter
                .limit(&limit_request("u1", 10, 1, false), true)
                .await
                .unwrap();
            assert!(!out.passed);
            assert_eq!(out.remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_namespace_not_found_without_permission() {
        let f = standalone();
        let err = f
            .limiter
            .limit(&limit_request("u1", 10, 1, false), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_override_parameters_apply() {
        let f = standalone();
        let ns = f.store.create_namespace("ws_1", "email.send").await.unwrap();
        f.store
            .upsert_override(NewOverride {
                namespace_id: ns.id.clone(),
                identifier: "vip@acme.com".to_string(),
                limit: 2,
                duration_ms: 60_000,
                async_mode: false,
                sharding: None,
            })
            .await
            .unwrap();

        let mut passed = 0;
        for _ in 0..4 {
            let out = f
                .limiter
                .limit(&limit_request("vip@acme.com", 100, 1, false), false)
                .await
                .unwrap();
            assert_eq!(out.limit, 2);
            assert!(out.override_id.is_some());
            if out.passed {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);
    }

    #[tokio::test]
    async fn test_cost_zero_peek_never_mutates() {
        let f = standalone();
        for _ in 0..5 {
            f.limiter
                .limit(&limit_request("u1", 10, 1, false), true)
                .await
                .unwrap();
        }
        for _ in 0..3 {
            let peek = f
                .limiter
                .limit(&limit_request("u1", 10, 0, false), true)
                .await
                .unwrap();
            assert!(peek.passed);
            assert_eq!(peek.remaining, 5);
        }
    }

    #[tokio::test]
    async fn test_sync_mode_unreachable_owner_errors() {
        let f = standalone();
        f.store.create_namespace("ws_1", "email.send").await.unwrap();
        // A peer on a loopback port nobody listens on. With two members some
        // identifiers hash to the unreachable peer.
        f.membership
            .observe_discovered(vec![Member {
                node_id: "node-b".to_string(),
                advertise_addr: "127.0.0.1".to_string(),
                rpc_port: 1,
                gossip_port: 3,
                joined_at_ms: 0,
            }]);

        let ring = f.membership.ring();
        let ns = f
            .store
            .namespace_by_name("ws_1", "email.send")
            .await
            .unwrap()
            .unwrap();
        let foreign = (0..200)
            .map(|i| format!("user-{}", i))
            .find(|id| {
                ring.owner(&format!("{}:{}", ns.id, id)).unwrap().node_id == "node-b"
            })
            .expect("some identifier must hash to node-b");

        let err = f
            .limiter
            .limit(&limit_request(&foreign, 10, 1, false), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::OriginUnavailable(_)));

        // A peek against the same dead owner answers locally, never errors.
        let peek = f
            .limiter
            .limit(&limit_request(&foreign, 10, 0, false), false)
            .await
            .unwrap();
        assert!(peek.passed);
    }

    #[tokio::test]
    async fn test_async_mode_unreachable_owner_stays_local() {
        let f = standalone();
        f.store.create_namespace("ws_1", "email.send").await.unwrap();
        f.membership
            .observe_discovered(vec![Member {
                node_id: "node-b".to_string(),
                advertise_addr: "127.0.0.1".to_string(),
                rpc_port: 1,
                gossip_port: 3,
                joined_at_ms: 0,
            }]);

        let ring = f.membership.ring();
        let ns = f
            .store
            .namespace_by_name("ws_1", "email.send")
            .await
            .unwrap()
            .unwrap();
        let foreign = (0..200)
            .map(|i| format!("user-{}", i))
            .find(|id| {
                ring.owner(&format!("{}:{}", ns.id, id)).unwrap().node_id == "node-b"
            })
            .unwrap();

        let out = f
            .limiter
            .limit(&limit_request(&foreign, 10, 1, true), false)
            .await
            .unwrap();
        assert!(out.passed);
        // The delta is queued for convergence, not lost.
        assert_eq!(f.limiter.batcher().depth(), 1);
    }

    #[tokio::test]
    async fn test_push_counter_dedupe_replays_response() {
        let f = standalone();
        let req = PushCounterRequest {
            request_id: "push_fixed".to_string(),
            namespace_id: "ns_1".to_string(),
            identifier: "u1".to_string(),
            delta: 4,
            window_start_ms: window_start(unix_ms(), 60_000),
            limit: 10,
            duration_ms: 60_000,
            granted: true,
        };

        let first = f.limiter.push_counter(req.clone()).await;
        assert_eq!(first.current, 4);

        // Same request id replays the stored response without re-merging.
        let replay = f.limiter.push_counter(req.clone()).await;
        assert_eq!(replay.current, 4);

        // A fresh id merges again.
        let mut next = req;
        next.request_id = "push_other".to_string();
        let second = f.limiter.push_counter(next).await;
        assert_eq!(second.current, 8);
    }

    #[tokio::test]
    async fn test_push_counter_sync_admission() {
        let f = standalone();
        let now = unix_ms();
        let mk = |id: &str, delta: u64| PushCounterRequest {
            request_id: id.to_string(),
            namespace_id: "ns_1".to_string(),
            identifier: "u1".to_string(),
            delta,
            window_start_ms: window_start(now, 60_000),
            limit: 5,
            duration_ms: 60_000,
            granted: false,
        };

        let a = f.limiter.push_counter(mk("p1", 3)).await;
        assert!(a.passed);
        let b = f.limiter.push_counter(mk("p2", 3)).await;
        assert!(!b.passed, "3+3 exceeds limit 5");
        let c = f.limiter.push_counter(mk("p3", 2)).await;
        assert!(c.passed);
    }

    #[tokio::test]
    async fn test_broadcast_exceeded_pins_local_counter() {
        let f = standalone();
        let ns = f.store.create_namespace("ws_1", "email.send").await.unwrap();

        let out = f
            .limiter
            .limit(&limit_request("pinned-user", 10, 1, true), false)
            .await
            .unwrap();
        assert!(out.passed);

        f.limiter
            .broadcast_exceeded(BroadcastExceededRequest {
                namespace_id: ns.id.clone(),
                identifier: "pinned-user".to_string(),
                limit: 10,
                window_start_ms: out.reset_at_ms - 60_000,
                reset_at_ms: out.reset_at_ms,
            })
            .await;

        let denied = f
            .limiter
            .limit(&limit_request("pinned-user", 10, 1, true), false)
            .await
            .unwrap();
        assert!(!denied.passed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn test_flush_merges_locally_after_ownership_returns() {
        // Deltas queued for a departed owner converge locally once the ring
        // shrinks back to just us.
        let f = standalone();
        let ns = f.store.create_namespace("ws_1", "email.send").await.unwrap();

        let key = counter_key(&ns.id, "u9", 10, 60_000);
        f.limiter.batcher().enqueue(
            "node-gone",
            PendingDelta {
                namespace_id: ns.id.clone(),
                identifier: "u9".to_string(),
                counter_key: key.clone(),
                delta: 4,
                window_start_ms: window_start(unix_ms(), 60_000),
                limit: 10,
                duration_ms: 60_000,
            },
        );

        f.limiter.flush_once().await;
        assert_eq!(f.limiter.batcher().depth(), 0);

        let peek = f
            .limiter
            .limit(&limit_request("u9", 10, 0, false), false)
            .await
            .unwrap();
        assert_eq!(peek.remaining, 6);
    }
}
