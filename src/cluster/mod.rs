pub mod discovery;
pub mod membership;
pub mod ring;
pub mod rpc;

pub use discovery::{Discovery, RegistryDiscovery, StaticDiscovery};
pub use membership::{Membership, MembershipConfig, PeerState};
pub use ring::HashRing;
pub use rpc::{
    BroadcastExceededRequest, PushCounterRequest, PushCounterResponse, RpcClient, RpcService,
};

use serde::{Deserialize, Serialize};

/// A cluster peer as disseminated through discovery and gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable for the lifetime of the process.
    pub node_id: String,
    pub advertise_addr: String,
    pub rpc_port: u16,
    pub gossip_port: u16,
    #[serde(default)]
    pub joined_at_ms: u64,
}

impl Member {
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.rpc_port)
    }

    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.gossip_port)
    }
}

/// Parse a static peer entry: `node_id=host:rpc_port:gossip_port`.
pub fn parse_static_peer(entry: &str) -> Result<Member, String> {
    let (node_id, rest) = entry
        .split_once('=')
        .ok_or_else(|| "expected node_id=host:rpc_port:gossip_port".to_string())?;
    if node_id.is_empty() {
        return Err("empty node id".to_string());
    }

    let parts: Vec<&str> = rest.rsplitn(3, ':').collect();
    if parts.len() != 3 {
        return Err("expected host:rpc_port:gossip_port".to_string());
    }
    let gossip_port: u16 = parts[0]
        .parse()
        .map_err(|_| format!("invalid gossip port: {}", parts[0]))?;
    let rpc_port: u16 = parts[1]
        .parse()
        .map_err(|_| format!("invalid rpc port: {}", parts[1]))?;
    let host = parts[2];
    if host.is_empty() {
        return Err("empty host".to_string());
    }

    Ok(Member {
        node_id: node_id.to_string(),
        advertise_addr: host.to_string(),
        rpc_port,
        gossip_port,
        joined_at_ms: 0,
    })
}

/// Generate a node id: hostname plus a random suffix. Stable for the
/// process lifetime, unique across restarts.
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let rand_suffix: u32 = rand::random();
    format!("{}-{:08x}", hostname, rand_suffix)
}

/// Determine the address peers should use to reach this node.
///
/// Preference order: K8s downward-API env vars, then the first non-loopback
/// non-link-local IPv4 on any interface.
pub fn detect_advertise_addr() -> anyhow::Result<String> {
    if let Ok(ip) = std::env::var("MY_POD_IP") {
        return Ok(ip);
    }
    if let Ok(ip) = std::env::var("POD_IP") {
        return Ok(ip);
    }
    if let Ok(ip) = std::env::var("HOST_IP") {
        return Ok(ip);
    }

    for iface in pnet_datalink::interfaces() {
        for ip in iface.ips {
            if let ipnetwork::IpNetwork::V4(ipv4) = ip {
                let addr = ipv4.ip();
                if !addr.is_loopback() && !addr.is_link_local() {
                    return Ok(addr.to_string());
                }
            }
        }
    }

    anyhow::bail!("failed to determine advertise address, set MY_POD_IP or HOST_IP env")
}
