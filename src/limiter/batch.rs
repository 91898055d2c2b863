use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One locally-granted increment awaiting convergence to the owner.
#[derive(Debug, Clone)]
pub struct PendingDelta {
    pub namespace_id: String,
    pub identifier: String,
    /// Local counter-map key; used to pin the shadow when the owner reports
    /// the limit consumed.
    pub counter_key: String,
    pub delta: u64,
    pub window_start_ms: u64,
    pub limit: u64,
    pub duration_ms: u64,
}

impl PendingDelta {
    /// Rough wire footprint, for the early-flush byte cap.
    fn estimated_bytes(&self) -> usize {
        self.namespace_id.len() + self.identifier.len() + self.counter_key.len() + 64
    }
}

/// Per-owner bounded queues of pending deltas.
///
/// The hot path only enqueues; a background flusher drains on an interval or
/// when a queue crosses the byte cap, whichever comes first. On overflow the
/// OLDEST deltas are dropped (the newest carry the freshest window) and the
/// loss is counted — the request path is never blocked.
pub struct DeltaBatcher {
    queues: DashMap<String, Mutex<OwnerQueue>>,
    capacity: usize,
    max_bytes: usize,
    flush_wake: Arc<Notify>,
    depth: AtomicUsize,
}

struct OwnerQueue {
    deltas: VecDeque<PendingDelta>,
    bytes: usize,
}

impl DeltaBatcher {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
            max_bytes,
            flush_wake: Arc::new(Notify::new()),
            depth: AtomicUsize::new(0),
        }
    }

    /// Notified when any queue crosses the byte cap; the flusher selects on
    /// this alongside its interval tick.
    pub fn flush_wake(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_wake)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn enqueue(&self, owner_node_id: &str, delta: PendingDelta) {
        let over_cap = {
            let queue = self
                .queues
                .entry(owner_node_id.to_string())
                .or_insert_with(|| {
                    Mutex::new(OwnerQueue {
                        deltas: VecDeque::new(),
                        bytes: 0,
                    })
                });
            let mut q = queue.lock().unwrap();

            q.bytes += delta.estimated_bytes();
            q.deltas.push_back(delta);
            self.depth.fetch_add(1, Ordering::Relaxed);

            let mut dropped = 0u64;
            while q.deltas.len() > self.capacity {
                if let Some(old) = q.deltas.pop_front() {
                    q.bytes = q.bytes.saturating_sub(old.estimated_bytes());
                    dropped += 1;
                }
            }
            if dropped > 0 {
                self.depth.fetch_sub(dropped as usize, Ordering::Relaxed);
                metrics::counter!("aegis_deltas_dropped_total", "reason" => "overflow")
                    .increment(dropped);
                tracing::warn!(
                    "batcher: queue overflow, owner={}, dropped={}",
                    owner_node_id,
                    dropped
                );
            }

            q.bytes >= self.max_bytes
        };

        metrics::gauge!("aegis_batch_queue_depth").set(self.depth() as f64);
        if over_cap {
            self.flush_wake.notify_one();
        }
    }

    /// Drain everything, coalescing deltas for the same counter and window
    /// into one push. Ownership is re-resolved by the flusher against the
    /// current ring, so deltas stranded by membership churn still converge.
    pub fn drain_all(&self) -> Vec<PendingDelta> {
        let mut merged: HashMap<(String, u64), PendingDelta> = HashMap::new();

        for queue in self.queues.iter() {
            let mut q = queue.lock().unwrap();
            let drained = q.deltas.len();
            q.bytes = 0;
            for d in q.deltas.drain(..) {
                let key = (d.counter_key.clone(), d.window_start_ms);
                match merged.get_mut(&key) {
                    Some(existing) => existing.delta += d.delta,
                    None => {
                        merged.insert(key, d);
                    }
                }
            }
            self.depth.fetch_sub(drained, Ordering::Relaxed);
        }

        metrics::gauge!("aegis_batch_queue_depth").set(self.depth() as f64);
        merged.into_values().collect()
    }

    /// Put deltas back after a failed push. Subject to the same capacity
    /// bound: when the queue is full the requeued (oldest) deltas give way
    /// first.
    pub fn requeue(&self, owner_node_id: &str, deltas: Vec<PendingDelta>) {
        if deltas.is_empty() {
            return;
        }
        let queue = self
            .queues
            .entry(owner_node_id.to_string())
            .or_insert_with(|| {
                Mutex::new(OwnerQueue {
                    deltas: VecDeque::new(),
                    bytes: 0,
                })
            });
        let mut q = queue.lock().unwrap();

        let mut added = 0isize;
        for d in deltas.into_iter().rev() {
            q.bytes += d.estimated_bytes();
            q.deltas.push_front(d);
            added += 1;
        }

        let mut dropped = 0u64;
        while q.deltas.len() > self.capacity {
            if let Some(old) = q.deltas.pop_front() {
                q.bytes = q.bytes.saturating_sub(old.estimated_bytes());
                dropped += 1;
                added -= 1;
            }
        }
        if dropped > 0 {
            metrics::counter!("aegis_deltas_dropped_total", "reason" => "requeue_overflow")
                .increment(dropped);
        }
        if added > 0 {
            self.depth.fetch_add(added as usize, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(identifier: &str, amount: u64, window: u64) -> PendingDelta {
        PendingDelta {
            namespace_id: "ns_1".to_string(),
            identifier: identifier.to_string(),
            counter_key: format!("ns_1:{}:10:60000", identifier),
            delta: amount,
            window_start_ms: window,
            limit: 10,
            duration_ms: 60_000,
        }
    }

    #[test]
    fn test_enqueue_and_drain_coalesces() {
        let b = DeltaBatcher::new(100, 1 << 20);
        b.enqueue("owner", delta("a", 1, 0));
        b.enqueue("owner", delta("a", 2, 0));
        b.enqueue("owner", delta("b", 1, 0));
        assert_eq!(b.depth(), 3);

        let mut drained = b.drain_all();
        drained.sort_by(|x, y| x.identifier.cmp(&y.identifier));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].identifier, "a");
        assert_eq!(drained[0].delta, 3);
        assert_eq!(drained[1].delta, 1);
        assert_eq!(b.depth(), 0);
    }

    #[test]
    fn test_same_counter_different_windows_stay_separate() {
        let b = DeltaBatcher::new(100, 1 << 20);
        b.enqueue("owner", delta("a", 1, 0));
        b.enqueue("owner", delta("a", 1, 60_000));
        assert_eq!(b.drain_all().len(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest_keeps_newest() {
        let b = DeltaBatcher::new(3, 1 << 20);
        for i in 0..5 {
            b.enqueue("owner", delta(&format!("id-{}", i), 1, 0));
        }
        assert_eq!(b.depth(), 3);

        let drained = b.drain_all();
        let ids: Vec<&str> = drained.iter().map(|d| d.identifier.as_str()).collect();
        assert!(!ids.contains(&"id-0"));
        assert!(!ids.contains(&"id-1"));
        assert!(ids.contains(&"id-4"));
    }

    #[test]
    fn test_byte_cap_triggers_wake() {
        let b = DeltaBatcher::new(1_000, 200);
        let wake = b.flush_wake();

        // Nothing pending yet.
        assert!(tokio_test::task::spawn(wake.notified()).poll().is_pending());

        for i in 0..4 {
            b.enqueue("owner", delta(&format!("long-identifier-{}", i), 1, 0));
        }
        let mut notified = tokio_test::task::spawn(wake.notified());
        assert!(notified.poll().is_ready());
    }

    #[test]
    fn test_requeue_preserves_order_at_front() {
        let b = DeltaBatcher::new(100, 1 << 20);
        b.enqueue("owner", delta("late", 1, 0));
        b.requeue("owner", vec![delta("first", 1, 1), delta("second", 1, 2)]);

        let queue = b.queues.get("owner").unwrap();
        let q = queue.lock().unwrap();
        let ids: Vec<&str> = q.deltas.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "late"]);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let b = DeltaBatcher::new(2, 1 << 20);
        b.enqueue("owner", delta("keep-1", 1, 0));
        b.enqueue("owner", delta("keep-2", 1, 0));
        b.requeue("owner", vec![delta("evicted", 1, 0)]);

        assert_eq!(b.depth(), 2);
        let drained = b.drain_all();
        let ids: Vec<&str> = drained.iter().map(|d| d.identifier.as_str()).collect();
        assert!(!ids.contains(&"evicted"));
    }
}
