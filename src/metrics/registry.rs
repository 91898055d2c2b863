use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds). The limit
/// path is expected to sit in the sub-millisecond buckets; the tail covers
/// degraded origin pushes.
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Idempotent — later calls reuse the first recorder, so
    /// call it freely from tests that assemble multiple nodes in-process.
    pub fn install() -> Self {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        let handle = HANDLE
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder")
            })
            .clone();

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // decision path
        describe_counter!(
            "aegis_limit_decisions_total",
            Unit::Count,
            "Rate-limit decisions by outcome and mode"
        );
        describe_histogram!(
            "aegis_limit_duration_seconds",
            Unit::Seconds,
            "End-to-end duration of one limit call"
        );
        describe_counter!(
            "aegis_override_hits_total",
            Unit::Count,
            "Limit calls whose policy came from a stored override"
        );
        describe_counter!(
            "aegis_namespace_autocreate_total",
            Unit::Count,
            "Namespaces auto-created on first use"
        );
        describe_gauge!(
            "aegis_counters_resident",
            Unit::Count,
            "Sliding-window counters currently resident"
        );

        // origin coordination
        describe_histogram!(
            "aegis_rpc_push_duration_seconds",
            Unit::Seconds,
            "PushCounter RPC duration (client and server side)"
        );
        describe_counter!(
            "aegis_push_deduped_total",
            Unit::Count,
            "Replayed PushCounter requests answered from the dedupe window"
        );
        describe_counter!(
            "aegis_push_requeued_total",
            Unit::Count,
            "Deltas requeued after a failed owner push"
        );
        describe_counter!(
            "aegis_deltas_dropped_total",
            Unit::Count,
            "Deltas lost to queue overflow"
        );
        describe_gauge!(
            "aegis_batch_queue_depth",
            Unit::Count,
            "Pending deltas across all per-owner queues"
        );
        describe_counter!(
            "aegis_broadcast_fanout_total",
            Unit::Count,
            "Exceeded broadcasts fanned out by this node as owner"
        );
        describe_counter!(
            "aegis_broadcast_received_total",
            Unit::Count,
            "Exceeded broadcasts received and pinned"
        );
        describe_counter!(
            "aegis_origin_local_fallback_total",
            Unit::Count,
            "Decisions served from the local shadow instead of the owner"
        );
        describe_counter!(
            "aegis_breaker_opened_total",
            Unit::Count,
            "Origin circuit breakers tripped open"
        );

        // cluster fabric
        describe_gauge!(
            "aegis_cluster_members",
            Unit::Count,
            "Alive members in the current view, self included"
        );
        describe_counter!(
            "aegis_gossip_transitions_total",
            Unit::Count,
            "Peer state transitions observed by gossip"
        );
        describe_counter!(
            "aegis_acl_rejected_total",
            Unit::Count,
            "RPC/gossip traffic rejected by the membership ACL"
        );
        describe_counter!(
            "aegis_discovery_poll_total",
            Unit::Count,
            "Discovery list/heartbeat attempts"
        );

        // cache
        describe_counter!(
            "aegis_cache_hits_total",
            Unit::Count,
            "Cache hits by tier"
        );
        describe_counter!(
            "aegis_cache_misses_total",
            Unit::Count,
            "Cache misses across all tiers"
        );
        describe_counter!(
            "aegis_cache_revalidations_total",
            Unit::Count,
            "Stale hits that scheduled a background refresh"
        );
        describe_counter!(
            "aegis_cache_origin_loads_total",
            Unit::Count,
            "Origin loader invocations (post single-flight)"
        );
        describe_counter!(
            "aegis_cache_evictions_total",
            Unit::Count,
            "Entries evicted by cache maintenance"
        );

        // public API
        describe_counter!(
            "aegis_http_requests_total",
            Unit::Count,
            "Public API requests by operation and status"
        );
        describe_histogram!(
            "aegis_http_request_duration_seconds",
            Unit::Seconds,
            "Public API request duration"
        );
        describe_gauge!(
            "aegis_http_requests_in_flight",
            Unit::Count,
            "Public API requests currently being processed"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
