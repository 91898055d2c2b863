pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — a single node with static discovery and no peers starts
    /// with zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded node configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for node identity and cluster
    /// wiring. Namespaces and overrides are managed exclusively through the
    /// API and the primary store — never from env vars.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AEGIS_NODE_ID") {
            self.cluster.node_id = Some(v);
        }
        if let Ok(v) = std::env::var("AEGIS_ADVERTISE_ADDR") {
            self.cluster.advertise_addr = Some(v);
        }
        if let Ok(v) = std::env::var("AEGIS_RPC_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.cluster.rpc_port = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_GOSSIP_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.cluster.gossip_port = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_HEARTBEAT_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.cluster.heartbeat_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_PROBE_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.cluster.probe_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("AEGIS_SUSPECT_TIMEOUT") {
            if let Ok(n) = v.parse::<u64>() {
                self.cluster.suspect_timeout_ms = n;
            }
        }

        if let Ok(v) = std::env::var("AEGIS_DISCOVERY_MODE") {
            self.discovery.mode = v;
        }
        if let Ok(v) = std::env::var("AEGIS_STATIC_PEERS") {
            self.discovery.static_peers =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("AEGIS_REGISTRY_URL") {
            self.discovery.registry_url = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.discovery.mode.as_str() {
            "static" => {}
            "registry" => {
                if self.discovery.registry_url.is_empty() {
                    anyhow::bail!("discovery.mode=registry requires discovery.registry_url");
                }
            }
            other => anyhow::bail!(
                "unknown discovery.mode: {} (expected \"static\" or \"registry\")",
                other
            ),
        }

        if self.cluster.rpc_port == self.cluster.gossip_port {
            anyhow::bail!("cluster.rpc_port and cluster.gossip_port must differ");
        }
        if self.cluster.probe_interval_ms == 0 {
            anyhow::bail!("cluster.probe_interval_ms must be positive");
        }
        if self.cluster.vnodes < 64 {
            anyhow::bail!("cluster.vnodes must be at least 64");
        }
        if self.cluster.gossip_fanout == 0 {
            anyhow::bail!("cluster.gossip_fanout must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.cache.maintenance_frequency) {
            anyhow::bail!("cache.maintenance_frequency must be within 0.0 ..= 1.0");
        }
        for (name, fresh, stale) in [
            (
                "namespace",
                self.cache.namespace_fresh_ms,
                self.cache.namespace_stale_ms,
            ),
            (
                "override",
                self.cache.override_fresh_ms,
                self.cache.override_stale_ms,
            ),
        ] {
            if fresh > stale {
                anyhow::bail!("cache.{}_fresh_ms must not exceed cache.{}_stale_ms", name, name);
            }
        }

        if self.limiter.flush_interval_ms == 0 {
            anyhow::bail!("limiter.flush_interval_ms must be positive");
        }
        if self.limiter.batch_capacity == 0 {
            anyhow::bail!("limiter.batch_capacity must be positive");
        }

        for peer in &self.discovery.static_peers {
            crate::cluster::parse_static_peer(peer)
                .map_err(|e| anyhow::anyhow!("invalid static peer {:?}: {}", peer, e))?;
        }

        Ok(())
    }
}
