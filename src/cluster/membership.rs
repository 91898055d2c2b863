use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::ring::HashRing;
use super::Member;
use crate::config::ClusterConfig;
use crate::counter::unix_ms;

/// Peer liveness as disseminated by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

impl PeerState {
    /// Dissemination precedence at equal incarnation: worse news wins.
    fn rank(self) -> u8 {
        match self {
            PeerState::Alive => 0,
            PeerState::Suspect => 1,
            PeerState::Dead => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            PeerState::Alive => "alive",
            PeerState::Suspect => "suspect",
            PeerState::Dead => "dead",
        }
    }
}

/// One member's view entry as carried in gossip exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub node_id: String,
    pub advertise_addr: String,
    pub rpc_port: u16,
    pub gossip_port: u16,
    pub incarnation: u64,
    pub state: PeerState,
}

impl Digest {
    fn member(&self, joined_at_ms: u64) -> Member {
        Member {
            node_id: self.node_id.clone(),
            advertise_addr: self.advertise_addr.clone(),
            rpc_port: self.rpc_port,
            gossip_port: self.gossip_port,
            joined_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GossipMessage {
    Ping { from: Digest, digests: Vec<Digest> },
    Ack { from: Digest, digests: Vec<Digest> },
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub suspect_timeout_ms: u64,
    pub fanout: usize,
    pub vnodes: usize,
}

impl From<&ClusterConfig> for MembershipConfig {
    fn from(cfg: &ClusterConfig) -> Self {
        Self {
            probe_interval_ms: cfg.probe_interval_ms,
            probe_timeout_ms: cfg.probe_timeout_ms,
            suspect_timeout_ms: cfg.effective_suspect_timeout_ms(),
            fanout: cfg.gossip_fanout,
            vnodes: cfg.vnodes,
        }
    }
}

struct PeerRecord {
    member: Member,
    state: PeerState,
    incarnation: u64,
    last_heard_ms: u64,
    suspected_at_ms: u64,
}

/// Gossip membership: maintains the live-peer set and the consistent-hash
/// ring built from it.
///
/// Each probe round pings `fanout` random non-dead peers with a digest of
/// the full view; divergences reconcile on merge. A peer missing its RTT
/// budget moves to suspect, and to dead after the grace window. A node is
/// never regressed to alive at a lower incarnation than last seen; a node
/// hearing itself suspected refutes by bumping its own incarnation.
///
/// The ring is immutable — membership changes publish a fresh ring through
/// an atomic pointer swap and in-flight requests keep their snapshot.
pub struct Membership {
    local: Member,
    incarnation: AtomicU64,
    peers: DashMap<String, PeerRecord>,
    ring: Arc<ArcSwap<HashRing>>,
    cfg: MembershipConfig,
    socket: Option<Arc<UdpSocket>>,
}

impl Membership {
    /// Bind the gossip socket and build the initial single-node ring.
    /// Port 0 binds an ephemeral port and patches the advertised member.
    pub async fn bind(mut local: Member, cfg: MembershipConfig) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", local.gossip_port)).await?;
        local.gossip_port = socket.local_addr()?.port();
        Ok(Arc::new(Self::build(local, cfg, Some(Arc::new(socket)))))
    }

    /// Membership without a socket, for in-process tests of the state
    /// machine.
    pub fn detached(local: Member, cfg: MembershipConfig) -> Arc<Self> {
        Arc::new(Self::build(local, cfg, None))
    }

    fn build(local: Member, cfg: MembershipConfig, socket: Option<Arc<UdpSocket>>) -> Self {
        let m = Self {
            local,
            incarnation: AtomicU64::new(1),
            peers: DashMap::new(),
            ring: Arc::new(ArcSwap::new(Arc::new(HashRing::empty()))),
            cfg,
            socket,
        };
        m.rebuild_ring();
        m
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    /// Shared handle for components that snapshot the ring per call.
    pub fn ring_handle(&self) -> Arc<ArcSwap<HashRing>> {
        Arc::clone(&self.ring)
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }

    /// The alive set, self included.
    pub fn alive_members(&self) -> Vec<Member> {
        let mut members = vec![self.local.clone()];
        for r in self.peers.iter() {
            if r.value().state == PeerState::Alive {
                members.push(r.value().member.clone());
            }
        }
        members
    }

    /// Alive peers excluding self, for broadcast fan-out.
    pub fn alive_peers(&self) -> Vec<Member> {
        self.peers
            .iter()
            .filter(|r| r.value().state == PeerState::Alive)
            .map(|r| r.value().member.clone())
            .collect()
    }

    /// Full member table for the admin surface.
    pub fn member_table(&self) -> Vec<(Member, PeerState, u64)> {
        let mut rows = vec![(
            self.local.clone(),
            PeerState::Alive,
            self.incarnation(),
        )];
        for r in self.peers.iter() {
            rows.push((
                r.value().member.clone(),
                r.value().state,
                r.value().incarnation,
            ));
        }
        rows.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
        rows
    }

    /// Membership-based ACL for the RPC and gossip listeners. A source
    /// address passes when it matches a known non-dead member (or self).
    pub fn is_member_addr(&self, ip: IpAddr) -> bool {
        let ip_str = ip.to_string();
        if self.local.advertise_addr == ip_str {
            return true;
        }
        self.peers.iter().any(|r| {
            r.value().state != PeerState::Dead && r.value().member.advertise_addr == ip_str
        })
    }

    /// Merge members learned from the discovery backend. Discovery only
    /// seeds: records already tracked by gossip are left untouched.
    pub fn observe_discovered(&self, members: Vec<Member>) {
        let now = unix_ms();
        let mut changed = false;
        for m in members {
            if m.node_id == self.local.node_id {
                continue;
            }
            if self.peers.contains_key(&m.node_id) {
                continue;
            }
            tracing::info!(
                "gossip: peer seeded from discovery, node={}, addr={}",
                m.node_id,
                m.gossip_addr()
            );
            self.peers.insert(
                m.node_id.clone(),
                PeerRecord {
                    member: Member {
                        joined_at_ms: now,
                        ..m
                    },
                    state: PeerState::Alive,
                    incarnation: 0,
                    last_heard_ms: now,
                    suspected_at_ms: 0,
                },
            );
            changed = true;
        }
        if changed {
            self.rebuild_ring();
        }
    }

    /// One gossip round: ping `fanout` random non-dead peers, then apply
    /// timeout transitions. The caller owns the interval loop.
    pub async fn probe_round(&self) {
        let targets: Vec<(String, SocketAddr)> = {
            let mut candidates: Vec<(String, String)> = self
                .peers
                .iter()
                .filter(|r| r.value().state != PeerState::Dead)
                .map(|r| (r.key().clone(), r.value().member.gossip_addr()))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates
                .into_iter()
                .take(self.cfg.fanout.max(1))
                .filter_map(|(id, addr)| {
                    addr.parse().ok().map(|sa| (id, sa))
                })
                .collect()
        };

        if let Some(socket) = &self.socket {
            let msg = GossipMessage::Ping {
                from: self.local_digest(),
                digests: self.digests(),
            };
            if let Ok(buf) = serde_json::to_vec(&msg) {
                for (node_id, addr) in &targets {
                    if let Err(e) = socket.send_to(&buf, addr).await {
                        tracing::debug!(
                            "gossip: ping send failed, node={}, addr={}, error={}",
                            node_id,
                            addr,
                            e
                        );
                    }
                }
            }
        }

        if self.evaluate_timeouts(unix_ms()) {
            self.rebuild_ring();
        }
    }

    /// Receive loop for the gossip socket. Runs until shutdown.
    pub async fn serve_gossip(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                recv = socket.recv_from(&mut buf) => {
                    let (len, src) = match recv {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("gossip: recv failed, error={}", e);
                            continue;
                        }
                    };
                    if let Some(reply) = self.handle_datagram(src, &buf[..len]) {
                        if let Err(e) = socket.send_to(&reply, src).await {
                            tracing::debug!("gossip: ack send failed, addr={}, error={}", src, e);
                        }
                    }
                }
                _ = shutdown.notified() => {
                    tracing::info!("gossip: listener stopped");
                    return;
                }
            }
        }
    }

    /// Process one datagram, returning the serialized reply if any.
    /// Split out from the socket loop so the protocol is testable directly.
    pub fn handle_datagram(&self, src: SocketAddr, buf: &[u8]) -> Option<Vec<u8>> {
        if !self.is_member_addr(src.ip()) {
            metrics::counter!("aegis_acl_rejected_total", "listener" => "gossip").increment(1);
            tracing::debug!("gossip: dropped datagram from non-member, addr={}", src);
            return None;
        }

        let msg: GossipMessage = match serde_json::from_slice(buf) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("gossip: malformed datagram, addr={}, error={}", src, e);
                return None;
            }
        };

        match msg {
            GossipMessage::Ping { from, digests } => {
                self.note_heard(&from);
                self.merge_digests(digests);
                let ack = GossipMessage::Ack {
                    from: self.local_digest(),
                    digests: self.digests(),
                };
                serde_json::to_vec(&ack).ok()
            }
            GossipMessage::Ack { from, digests } => {
                self.note_heard(&from);
                self.merge_digests(digests);
                None
            }
        }
    }

    /// Merge a remote view. Rebuilds the ring when the alive set changed.
    pub fn merge_digests(&self, digests: Vec<Digest>) {
        let mut changed = false;
        for d in digests {
            changed |= self.merge_digest(d);
        }
        if changed {
            self.rebuild_ring();
        }
    }

    fn merge_digest(&self, d: Digest) -> bool {
        let now = unix_ms();

        // News about ourselves: refute anything worse than alive by bumping
        // our incarnation past the rumor's.
        if d.node_id == self.local.node_id {
            if d.state != PeerState::Alive {
                let mine = self.incarnation.load(Ordering::Acquire);
                if d.incarnation >= mine {
                    self.incarnation.store(d.incarnation + 1, Ordering::Release);
                    tracing::info!(
                        "gossip: refuting {} rumor, incarnation {} -> {}",
                        d.state.label(),
                        mine,
                        d.incarnation + 1
                    );
                }
            }
            return false;
        }

        match self.peers.entry(d.node_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let state = d.state;
                slot.insert(PeerRecord {
                    member: d.member(now),
                    state,
                    incarnation: d.incarnation,
                    last_heard_ms: now,
                    suspected_at_ms: if state == PeerState::Alive { 0 } else { now },
                });
                metrics::counter!(
                    "aegis_gossip_transitions_total",
                    "state" => state.label(),
                )
                .increment(1);
                state == PeerState::Alive
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let rec = slot.get_mut();
                let adopt = d.incarnation > rec.incarnation
                    || (d.incarnation == rec.incarnation && d.state.rank() > rec.state.rank());
                if !adopt {
                    return false;
                }

                let was = rec.state;
                rec.incarnation = d.incarnation;
                rec.state = d.state;
                rec.member.advertise_addr = d.advertise_addr;
                rec.member.rpc_port = d.rpc_port;
                rec.member.gossip_port = d.gossip_port;
                match d.state {
                    PeerState::Alive => rec.last_heard_ms = now,
                    PeerState::Suspect => {
                        if was != PeerState::Suspect {
                            rec.suspected_at_ms = now;
                        }
                    }
                    PeerState::Dead => {
                        if was == PeerState::Alive {
                            rec.suspected_at_ms = now;
                        }
                    }
                }

                if was != rec.state {
                    tracing::info!(
                        "gossip: peer {} -> {}, node={}, incarnation={}",
                        was.label(),
                        rec.state.label(),
                        d.node_id,
                        d.incarnation
                    );
                    metrics::counter!(
                        "aegis_gossip_transitions_total",
                        "state" => rec.state.label(),
                    )
                    .increment(1);
                    return true;
                }
                false
            }
        }
    }

    /// Apply probe-timeout transitions. Returns true when the alive set
    /// changed. Public for tests; `probe_round` calls it every round.
    pub fn evaluate_timeouts(&self, now_ms: u64) -> bool {
        let rtt_budget = self.cfg.probe_interval_ms + self.cfg.probe_timeout_ms;
        let mut changed = false;
        let mut purge = Vec::new();

        for mut r in self.peers.iter_mut() {
            let rec = r.value_mut();
            match rec.state {
                PeerState::Alive => {
                    if now_ms.saturating_sub(rec.last_heard_ms) > rtt_budget {
                        rec.state = PeerState::Suspect;
                        rec.suspected_at_ms = now_ms;
                        changed = true;
                        tracing::warn!(
                            "gossip: peer suspected (probe missed), node={}",
                            rec.member.node_id
                        );
                        metrics::counter!(
                            "aegis_gossip_transitions_total",
                            "state" => "suspect",
                        )
                        .increment(1);
                    }
                }
                PeerState::Suspect => {
                    if now_ms.saturating_sub(rec.suspected_at_ms) > self.cfg.suspect_timeout_ms {
                        rec.state = PeerState::Dead;
                        changed = true;
                        tracing::warn!(
                            "gossip: peer declared dead, node={}",
                            rec.member.node_id
                        );
                        metrics::counter!(
                            "aegis_gossip_transitions_total",
                            "state" => "dead",
                        )
                        .increment(1);
                    }
                }
                PeerState::Dead => {
                    // Keep the tombstone around long enough to disseminate,
                    // then drop it so a restarted node can rejoin cleanly.
                    if now_ms.saturating_sub(rec.suspected_at_ms)
                        > self.cfg.suspect_timeout_ms.saturating_mul(10)
                    {
                        purge.push(rec.member.node_id.clone());
                    }
                }
            }
        }

        for node_id in purge {
            self.peers.remove(&node_id);
        }
        changed
    }

    /// A peer we heard from directly is alive at its advertised incarnation.
    fn note_heard(&self, from: &Digest) {
        if from.node_id == self.local.node_id {
            return;
        }
        let now = unix_ms();
        let mut revived = false;
        if let Some(mut rec) = self.peers.get_mut(&from.node_id) {
            if from.incarnation >= rec.incarnation {
                rec.last_heard_ms = now;
                rec.incarnation = from.incarnation;
                if rec.state != PeerState::Alive {
                    rec.state = PeerState::Alive;
                    revived = true;
                }
            }
        } else {
            self.peers.insert(
                from.node_id.clone(),
                PeerRecord {
                    member: from.member(now),
                    state: PeerState::Alive,
                    incarnation: from.incarnation,
                    last_heard_ms: now,
                    suspected_at_ms: 0,
                },
            );
            revived = true;
        }
        if revived {
            self.rebuild_ring();
        }
    }

    fn local_digest(&self) -> Digest {
        Digest {
            node_id: self.local.node_id.clone(),
            advertise_addr: self.local.advertise_addr.clone(),
            rpc_port: self.local.rpc_port,
            gossip_port: self.local.gossip_port,
            incarnation: self.incarnation(),
            state: PeerState::Alive,
        }
    }

    fn digests(&self) -> Vec<Digest> {
        let mut out = vec![self.local_digest()];
        for r in self.peers.iter() {
            out.push(Digest {
                node_id: r.value().member.node_id.clone(),
                advertise_addr: r.value().member.advertise_addr.clone(),
                rpc_port: r.value().member.rpc_port,
                gossip_port: r.value().member.gossip_port,
                incarnation: r.value().incarnation,
                state: r.value().state,
            });
        }
        out
    }

    fn rebuild_ring(&self) {
        let members = self.alive_members();
        metrics::gauge!("aegis_cluster_members").set(members.len() as f64);
        let ring = HashRing::build(members, self.cfg.vnodes);
        self.ring.store(Arc::new(ring));
    }
}
