use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Milliseconds since the unix epoch. Window math and `reset` fields on the
/// wire all use this clock.
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-process sliding-window counters, keyed by
/// `(namespace_id, identifier, limit, duration)`.
///
/// A counter blends the previous fixed window into the current one by the
/// fraction of the previous window still overlapping, which removes the
/// classic fixed-window boundary burst. The same map holds authoritative
/// counters (this node owns the identifier on the ring) and shadow counters
/// (local fast-path copies that converge to the owner asynchronously).
///
/// **GC**: counters idle for 2x their duration are periodically evicted.
/// A hard cap bounds the map under unbounded-identifier workloads; beyond
/// it the oldest entries are force-evicted regardless of idle time.
pub struct CounterStore {
    counters: DashMap<String, Arc<Counter>>,
    /// Hard cap on resident counters.
    max_entries: usize,
}

/// One sliding window. The window state sits behind a `std::sync::Mutex` —
/// the critical section is a handful of arithmetic ops and never suspends.
/// `last_access` and the exceeded pin are atomics updated outside the lock.
struct Counter {
    inner: Mutex<WindowState>,
    /// Last touch in unix ms, for GC.
    last_access: AtomicU64,
    /// Deny-until pin (unix ms) set by an owner's exceeded broadcast.
    /// 0 means unpinned. Last-writer-wins on the farthest reset.
    pinned_until: AtomicU64,
    /// Window start of the last exceeded broadcast claimed for this counter.
    /// Guards against repeated fan-outs within one window.
    broadcast_window: AtomicU64,
    /// Idle expiry: 2x the counter duration.
    idle_expiry_ms: u64,
}

struct WindowState {
    /// Start of the current window (unix ms, multiple of the duration).
    current_start: u64,
    current: u64,
    previous: u64,
}

/// Outcome of a local sliding-window decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub passed: bool,
    /// `max(0, limit - ceil(effective))` after any increment.
    pub remaining: u64,
    /// End of the current window (unix ms).
    pub reset_at_ms: u64,
    /// Ceiled effective count after the decision.
    pub effective: u64,
    /// True when the decision came from an exceeded pin, not window math.
    pub pinned: bool,
}

/// Outcome of merging a pre-granted delta into an authoritative counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merged {
    /// Ceiled effective count after the merge.
    pub current: u64,
    /// True when the authoritative count has consumed the full limit.
    pub exceeded: bool,
    pub reset_at_ms: u64,
}

pub const DEFAULT_MAX_COUNTERS: usize = 100_000;

impl CounterStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_COUNTERS)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            counters: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Full sliding-window decision: roll windows, blend the previous window,
    /// admit and increment when the cost fits.
    ///
    /// `cost = 0` is a peek: it never mutates state and always passes, pin or
    /// not.
    pub fn apply(&self, key: &str, limit: u64, duration_ms: u64, cost: u64, now_ms: u64) -> Decision {
        let counter = self.get_or_create(key, duration_ms);
        counter.last_access.store(now_ms, Ordering::Relaxed);

        let window_start = window_start(now_ms, duration_ms);
        let reset_at_ms = window_start + duration_ms;

        if cost == 0 {
            let effective = counter.effective_at(now_ms, duration_ms);
            return Decision {
                passed: true,
                remaining: limit.saturating_sub(effective.ceil() as u64),
                reset_at_ms,
                effective: effective.ceil() as u64,
                pinned: false,
            };
        }

        let pinned_until = counter.pinned_until.load(Ordering::Acquire);
        if pinned_until > now_ms {
            return Decision {
                passed: false,
                remaining: 0,
                reset_at_ms: pinned_until,
                effective: limit,
                pinned: true,
            };
        }

        let mut state = counter.inner.lock().unwrap();
        state.roll(window_start, duration_ms);

        let effective = state.effective(now_ms, duration_ms);
        let passed = effective + cost as f64 <= limit as f64;
        if passed {
            state.current = state.current.saturating_add(cost);
        }
        let effective_after = effective + if passed { cost as f64 } else { 0.0 };

        Decision {
            passed,
            remaining: limit.saturating_sub(effective_after.ceil() as u64),
            reset_at_ms,
            effective: effective_after.ceil() as u64,
            pinned: false,
        }
    }

    /// Owner-side merge of a pre-granted delta from a peer. The requests
    /// behind the delta already passed at the edge, so the merge is
    /// unconditional — the authoritative count may land past the limit.
    ///
    /// A delta for a window older than the previous one is dropped; its
    /// events decayed out of the sliding blend anyway.
    pub fn merge_granted(
        &self,
        key: &str,
        delta: u64,
        delta_window_start: u64,
        limit: u64,
        duration_ms: u64,
        now_ms: u64,
    ) -> Merged {
        let counter = self.get_or_create(key, duration_ms);
        counter.last_access.store(now_ms, Ordering::Relaxed);

        let window_start = window_start(now_ms, duration_ms);
        let mut state = counter.inner.lock().unwrap();
        state.roll(window_start, duration_ms);

        if delta_window_start == state.current_start {
            state.current = state.current.saturating_add(delta);
        } else if delta_window_start + duration_ms == state.current_start {
            state.previous = state.previous.saturating_add(delta);
        }
        // Anything older is dropped.

        let effective = state.effective(now_ms, duration_ms);
        Merged {
            current: effective.ceil() as u64,
            exceeded: effective >= limit as f64,
            reset_at_ms: window_start + duration_ms,
        }
    }

    /// Pin a counter to deny-until `reset_at_ms` after an owner's exceeded
    /// broadcast. Last-writer-wins on the farthest reset; a reset already in
    /// the past is ignored.
    pub fn pin_exceeded(&self, key: &str, reset_at_ms: u64, duration_ms: u64, now_ms: u64) {
        if reset_at_ms <= now_ms {
            return;
        }
        let counter = self.get_or_create(key, duration_ms);
        counter.last_access.store(now_ms, Ordering::Relaxed);
        counter.pinned_until.fetch_max(reset_at_ms, Ordering::AcqRel);
    }

    /// Claim the exceeded broadcast for `window_start`. Returns true exactly
    /// once per counter per window — the caller that wins performs the
    /// fan-out.
    pub fn claim_broadcast(&self, key: &str, window_start: u64, duration_ms: u64) -> bool {
        let counter = self.get_or_create(key, duration_ms);
        let prev = counter.broadcast_window.swap(window_start, Ordering::AcqRel);
        prev != window_start
    }

    /// Remove counters idle for 2x their duration. If the map still exceeds
    /// the cap afterwards, force-evict the oldest entries until under it.
    pub fn evict_stale(&self, now_ms: u64) {
        self.counters.retain(|_, c| {
            let idle = now_ms.saturating_sub(c.last_access.load(Ordering::Relaxed));
            idle < c.idle_expiry_ms || c.pinned_until.load(Ordering::Relaxed) > now_ms
        });

        let overflow = self.counters.len().saturating_sub(self.max_entries);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|r| {
                let age = now_ms.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (r.key().clone(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.counters.remove(&key);
        }
    }

    /// Spawn the periodic GC task. Call once after construction.
    pub fn start_gc(self: &Arc<Self>, interval: std::time::Duration, shutdown: Arc<tokio::sync::Notify>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.evict_stale(unix_ms());
                        metrics::gauge!("aegis_counters_resident").set(store.len() as f64);
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    fn get_or_create(&self, key: &str, duration_ms: u64) -> Arc<Counter> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.counters.get(key) {
            return entry.value().clone();
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Counter {
                    inner: Mutex::new(WindowState {
                        current_start: 0,
                        current: 0,
                        previous: 0,
                    }),
                    last_access: AtomicU64::new(0),
                    pinned_until: AtomicU64::new(0),
                    broadcast_window: AtomicU64::new(0),
                    idle_expiry_ms: duration_ms.saturating_mul(2),
                })
            })
            .clone()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    fn effective_at(&self, now_ms: u64, duration_ms: u64) -> f64 {
        let window = window_start(now_ms, duration_ms);
        let mut state = self.inner.lock().unwrap();
        state.roll(window, duration_ms);
        state.effective(now_ms, duration_ms)
    }
}

impl WindowState {
    /// Advance to the window containing `window_start`. The previous count
    /// carries over only across one adjacent boundary; a longer gap means the
    /// old window fully decayed.
    fn roll(&mut self, window_start: u64, duration_ms: u64) {
        if self.current_start == window_start {
            return;
        }
        if self.current_start + duration_ms == window_start {
            self.previous = self.current;
        } else {
            self.previous = 0;
        }
        self.current = 0;
        self.current_start = window_start;
    }

    /// `current + weight * previous` with `weight = 1 - elapsed / duration`.
    fn effective(&self, now_ms: u64, duration_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.current_start);
        let weight = if duration_ms > 0 {
            1.0 - (elapsed as f64 / duration_ms as f64)
        } else {
            0.0
        };
        self.current as f64 + weight.max(0.0) * self.previous as f64
    }
}

fn window_start(now_ms: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        return now_ms;
    }
    (now_ms / duration_ms) * duration_ms
}
