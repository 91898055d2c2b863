use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

/// Per-owner circuit breakers for origin push traffic.
///
/// Consecutive push failures to one owner accumulate strikes; at the
/// threshold that owner's breaker opens and the coordinator stops pushing,
/// treating its local shadow counter as authoritative. Once the cooldown
/// elapses a single probe push is admitted at a time; enough confirmed
/// probes close the breaker, one failed probe starts a fresh cooldown.
/// Owners are independent — an unreachable origin never blocks pushes to
/// the rest of the cluster.
pub struct OriginBreakers {
    owners: DashMap<String, Mutex<OwnerState>>,
}

/// One owner's breaker position. The whole state sits under a single
/// mutex; a transition is a handful of comparisons and the lock is never
/// held across a suspension point.
#[derive(Debug, Clone, Copy)]
enum OwnerState {
    /// Healthy. `strikes` counts consecutive failures.
    Closed { strikes: u32 },
    /// Tripped at `since`; pushes are skipped until the cooldown elapses.
    Open { since: Instant },
    /// Cooling down. `probe_started` is the in-flight probe, if any;
    /// `confirmations` counts successful probes so far.
    HalfOpen {
        probe_started: Option<Instant>,
        confirmations: u32,
    },
}

impl OwnerState {
    fn label(&self) -> &'static str {
        match self {
            OwnerState::Closed { .. } => "closed",
            OwnerState::Open { .. } => "open",
            OwnerState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Verdict for a push that is about to be sent.
pub enum BreakerCheck {
    /// Closed — push normally.
    Allowed,
    /// Half-open — this push is the recovery probe.
    Probe,
    /// Open, or a probe is already in flight — skip the owner, stay local.
    Rejected,
}

impl OriginBreakers {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }

    /// Decide whether a push to `node_id` may go out, advancing
    /// Open → HalfOpen when the cooldown has elapsed. A probe whose result
    /// never arrived (caller cancelled mid-push) stops blocking the slot
    /// after one further cooldown.
    pub fn check(&self, node_id: &str, config: &BreakerConfig) -> BreakerCheck {
        let cooldown = Duration::from_millis(config.open_duration_ms);
        self.with_state(node_id, |state| match *state {
            OwnerState::Closed { .. } => BreakerCheck::Allowed,
            OwnerState::Open { since } => {
                if since.elapsed() < cooldown {
                    return BreakerCheck::Rejected;
                }
                *state = OwnerState::HalfOpen {
                    probe_started: Some(Instant::now()),
                    confirmations: 0,
                };
                BreakerCheck::Probe
            }
            OwnerState::HalfOpen {
                probe_started,
                confirmations,
            } => {
                if let Some(started) = probe_started {
                    if started.elapsed() < cooldown {
                        return BreakerCheck::Rejected;
                    }
                }
                *state = OwnerState::HalfOpen {
                    probe_started: Some(Instant::now()),
                    confirmations,
                };
                BreakerCheck::Probe
            }
        })
    }

    /// A push to `node_id` succeeded.
    pub fn record_success(&self, node_id: &str, config: &BreakerConfig) {
        self.with_state(node_id, |state| match *state {
            OwnerState::Closed { .. } => {
                *state = OwnerState::Closed { strikes: 0 };
            }
            OwnerState::HalfOpen { confirmations, .. } => {
                let confirmations = confirmations + 1;
                if confirmations >= config.success_threshold {
                    *state = OwnerState::Closed { strikes: 0 };
                    tracing::info!(
                        "origin_breaker: closed, owner={}, confirmations={}",
                        node_id,
                        confirmations
                    );
                } else {
                    *state = OwnerState::HalfOpen {
                        probe_started: None,
                        confirmations,
                    };
                }
            }
            // A response that raced the trip carries no signal about the
            // cooled-down owner.
            OwnerState::Open { .. } => {}
        });
    }

    /// A push to `node_id` failed.
    pub fn record_failure(&self, node_id: &str, config: &BreakerConfig) {
        self.with_state(node_id, |state| match *state {
            OwnerState::Closed { strikes } => {
                let strikes = strikes + 1;
                if strikes >= config.failure_threshold {
                    *state = OwnerState::Open {
                        since: Instant::now(),
                    };
                    tracing::warn!(
                        "origin_breaker: opened, owner={}, strikes={}",
                        node_id,
                        strikes
                    );
                    metrics::counter!("aegis_breaker_opened_total").increment(1);
                } else {
                    *state = OwnerState::Closed { strikes };
                }
            }
            OwnerState::HalfOpen { .. } => {
                *state = OwnerState::Open {
                    since: Instant::now(),
                };
                tracing::warn!("origin_breaker: probe failed, owner={}", node_id);
                metrics::counter!("aegis_breaker_opened_total").increment(1);
            }
            OwnerState::Open { .. } => {}
        });
    }

    /// Owner → state label, sorted, for the admin cluster view.
    pub fn table(&self) -> Vec<(String, &'static str)> {
        let mut rows: Vec<(String, &'static str)> = self
            .owners
            .iter()
            .map(|r| (r.key().clone(), r.value().lock().unwrap().label()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drop breakers for owners that left the membership.
    pub fn retain_nodes(&self, active: &std::collections::HashSet<String>) {
        self.owners.retain(|k, _| active.contains(k));
    }

    fn with_state<R>(&self, node_id: &str, f: impl FnOnce(&mut OwnerState) -> R) -> R {
        // Fast path: known owner — no allocation.
        if let Some(slot) = self.owners.get(node_id) {
            return f(&mut slot.value().lock().unwrap());
        }
        let slot = self
            .owners
            .entry(node_id.to_string())
            .or_insert_with(|| Mutex::new(OwnerState::Closed { strikes: 0 }));
        let result = f(&mut slot.value().lock().unwrap());
        result
    }
}

impl Default for OriginBreakers {
    fn default() -> Self {
        Self::new()
    }
}
