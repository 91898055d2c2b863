use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_static_peer, Member};
use crate::config::DiscoveryConfig;

/// Seeding backend for the initial peer view. Discovery is only the seed:
/// once any live peer has been contacted, gossip disseminates the rest.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &'static str;

    async fn register(&self, me: &Member) -> anyhow::Result<()>;

    /// Refresh this node's registration TTL.
    async fn heartbeat(&self, me: &Member) -> anyhow::Result<()>;

    async fn list(&self) -> anyhow::Result<Vec<Member>>;

    async fn deregister(&self, me: &Member) -> anyhow::Result<()>;
}

/// Compiled-in peer list. Used for bootstrapping and deterministic test
/// clusters; register/heartbeat/deregister are no-ops.
pub struct StaticDiscovery {
    peers: Vec<Member>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Member>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn register(&self, _me: &Member) -> anyhow::Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _me: &Member) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<Member>> {
        Ok(self.peers.clone())
    }

    async fn deregister(&self, _me: &Member) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared HTTP/JSON registry. Each node PUTs its record with a TTL and
/// re-heartbeats at a fraction of it; a full scan on startup yields the
/// initial peer list. Registry loss after startup is tolerated — gossip
/// keeps the view alive.
pub struct RegistryDiscovery {
    http: reqwest::Client,
    base_url: String,
    ttl_secs: u64,
}

impl RegistryDiscovery {
    pub fn new(base_url: &str, ttl_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl_secs,
        })
    }

    fn instance_url(&self, node_id: &str) -> String {
        format!("{}/v1/instances/{}", self.base_url, node_id)
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn register(&self, me: &Member) -> anyhow::Result<()> {
        let resp = self
            .http
            .put(self.instance_url(&me.node_id))
            .query(&[("ttl", self.ttl_secs)])
            .json(me)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry register failed: {}", resp.status());
        }
        Ok(())
    }

    async fn heartbeat(&self, me: &Member) -> anyhow::Result<()> {
        // A re-PUT refreshes the TTL; the registry treats it as an upsert.
        self.register(me).await
    }

    async fn list(&self) -> anyhow::Result<Vec<Member>> {
        let resp = self
            .http
            .get(format!("{}/v1/instances", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry list failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn deregister(&self, me: &Member) -> anyhow::Result<()> {
        let resp = self
            .http
            .delete(self.instance_url(&me.node_id))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry deregister failed: {}", resp.status());
        }
        Ok(())
    }
}

/// Build the configured discovery backend.
pub fn from_config(cfg: &DiscoveryConfig) -> anyhow::Result<Arc<dyn Discovery>> {
    match cfg.mode.as_str() {
        "static" => {
            let peers = cfg
                .static_peers
                .iter()
                .map(|p| parse_static_peer(p).map_err(|e| anyhow::anyhow!("{}: {}", p, e)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Arc::new(StaticDiscovery::new(peers)))
        }
        "registry" => Ok(Arc::new(RegistryDiscovery::new(
            &cfg.registry_url,
            cfg.registry_ttl_secs,
        )?)),
        other => anyhow::bail!("unknown discovery mode: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_lists_seeds() {
        let peers = vec![
            parse_static_peer("node-b=10.0.0.2:7301:7302").unwrap(),
            parse_static_peer("node-c=10.0.0.3:7301:7302").unwrap(),
        ];
        let disc = StaticDiscovery::new(peers);
        let me = Member {
            node_id: "node-a".into(),
            advertise_addr: "10.0.0.1".into(),
            rpc_port: 7301,
            gossip_port: 7302,
            joined_at_ms: 0,
        };

        disc.register(&me).await.unwrap();
        disc.heartbeat(&me).await.unwrap();
        let listed = disc.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        disc.deregister(&me).await.unwrap();
    }

    #[test]
    fn test_from_config_static() {
        let cfg = DiscoveryConfig {
            mode: "static".into(),
            static_peers: vec!["node-b=10.0.0.2:7301:7302".into()],
            registry_url: String::new(),
            registry_ttl_secs: 60,
        };
        let disc = from_config(&cfg).unwrap();
        assert_eq!(disc.name(), "static");
    }

    #[test]
    fn test_from_config_registry() {
        let cfg = DiscoveryConfig {
            mode: "registry".into(),
            static_peers: vec![],
            registry_url: "http://127.0.0.1:8500/".into(),
            registry_ttl_secs: 60,
        };
        let disc = from_config(&cfg).unwrap();
        assert_eq!(disc.name(), "registry");
    }
}
