use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Workspace tokens accepted on the public API. The key CRUD surface owns
    /// real credential issuance; the limiter core only resolves a token to a
    /// workspace principal.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Identity and timers for this node's participation in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable for the lifetime of the process. Generated from the hostname
    /// plus a random suffix when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Address peers use to reach this node. Auto-detected when unset.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,

    /// Registry re-heartbeat cadence (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Gossip probe cadence (milliseconds).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// RTT budget for a probe ack before the peer is suspected.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace window between suspect and dead. 0 means 5x the probe interval.
    #[serde(default)]
    pub suspect_timeout_ms: u64,

    /// How many random peers each gossip round probes.
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    /// Virtual positions per member on the hash ring.
    #[serde(default = "default_vnodes")]
    pub vnodes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            advertise_addr: None,
            rpc_port: default_rpc_port(),
            gossip_port: default_gossip_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            suspect_timeout_ms: 0,
            gossip_fanout: default_gossip_fanout(),
            vnodes: default_vnodes(),
        }
    }
}

impl ClusterConfig {
    /// Effective suspect→dead grace window.
    pub fn effective_suspect_timeout_ms(&self) -> u64 {
        if self.suspect_timeout_ms > 0 {
            self.suspect_timeout_ms
        } else {
            self.probe_interval_ms * 5
        }
    }
}

fn default_rpc_port() -> u16 {
    7261
}

fn default_gossip_port() -> u16 {
    7262
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_probe_interval() -> u64 {
    1_000
}

fn default_probe_timeout() -> u64 {
    200
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_vnodes() -> usize {
    64
}

/// How this node finds its initial peer set. Gossip takes over once any
/// live peer has been contacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// "static" (compiled-in peer list) or "registry" (shared TTL registry).
    #[serde(default = "default_discovery_mode")]
    pub mode: String,

    /// Seed peers for static mode: `node_id=host:rpc_port:gossip_port`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub static_peers: Vec<String>,

    #[serde(default)]
    pub registry_url: String,

    /// TTL attached to the registry entry; expiry removes the node.
    #[serde(default = "default_registry_ttl")]
    pub registry_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: default_discovery_mode(),
            static_peers: Vec::new(),
            registry_url: String::new(),
            registry_ttl_secs: default_registry_ttl(),
        }
    }
}

fn default_discovery_mode() -> String {
    "static".to_string()
}

fn default_registry_ttl() -> u64 {
    60
}

/// Sizing and freshness windows for the tiered lookup cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Per-tier bound on resident entries; FIFO eviction beyond it.
    #[serde(default = "default_cache_max_items")]
    pub max_items: usize,

    /// Probability that a `set` also runs a maintenance sweep (0.0 ..= 1.0).
    #[serde(default = "default_maintenance_frequency")]
    pub maintenance_frequency: f64,

    #[serde(default = "default_namespace_fresh")]
    pub namespace_fresh_ms: u64,

    #[serde(default = "default_namespace_stale")]
    pub namespace_stale_ms: u64,

    #[serde(default = "default_namespace_fresh")]
    pub override_fresh_ms: u64,

    #[serde(default = "default_namespace_stale")]
    pub override_stale_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: default_cache_max_items(),
            maintenance_frequency: default_maintenance_frequency(),
            namespace_fresh_ms: default_namespace_fresh(),
            namespace_stale_ms: default_namespace_stale(),
            override_fresh_ms: default_namespace_fresh(),
            override_stale_ms: default_namespace_stale(),
        }
    }
}

fn default_cache_max_items() -> usize {
    10_000
}

fn default_maintenance_frequency() -> f64 {
    0.01
}

fn default_namespace_fresh() -> u64 {
    10_000
}

fn default_namespace_stale() -> u64 {
    60_000
}

/// Coordinator tuning: batching, peer RPC deadlines, origin breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Background flush cadence for per-owner delta batches.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Per-owner queue bound (entries). Overflow drops the oldest deltas.
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,

    /// A queue reaching this estimated size is flushed before the next tick.
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Deadline for a single peer RPC.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Tag prepended to identifiers for edge-sharded policies.
    /// Falls back to the node id when unset.
    #[serde(default)]
    pub edge_tag: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            batch_capacity: default_batch_capacity(),
            batch_max_bytes: default_batch_max_bytes(),
            rpc_timeout_ms: default_rpc_timeout(),
            breaker: BreakerConfig::default(),
            edge_tag: None,
        }
    }
}

fn default_flush_interval() -> u64 {
    100
}

fn default_batch_capacity() -> usize {
    4_096
}

fn default_batch_max_bytes() -> usize {
    64 * 1024
}

fn default_rpc_timeout() -> u64 {
    50
}

/// Repeated push failures to one owner trip the breaker; the coordinator
/// then treats its local shadow as authoritative until cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_duration")]
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tokens: Vec<TokenConfig>,
}

/// Maps a bearer token to a workspace principal and its permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,

    pub workspace_id: String,

    /// Allows auto-creation of namespaces on first use.
    #[serde(default)]
    pub create_namespace: bool,

    /// Allows override CRUD.
    #[serde(default = "default_true")]
    pub manage_overrides: bool,
}

fn default_true() -> bool {
    true
}
