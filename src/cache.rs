//! The dual-store LRU+MFA cache that coordinates two [`Store`]s.
//!
//! A fresh key always lands in the LRU store with `a = 1`. It migrates to
//! the MFA store only by being evicted from a full LRU and beating (or
//! fitting alongside) whatever MFA already holds; it migrates back only by
//! being displaced from a full MFA while still outperforming the LRU
//! minimum. Everything else falls off the end and is gone.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::clock::LogicalClock;
use crate::error::{ForwarderError, Result};
use crate::store::{OrderMode, PutOutcome, Store};

/// Counters tracked across the lifetime of a [`Cache`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheMetrics {
    pub hit_mfa: u64,
    pub miss_mfa: u64,
    pub hit_lru: u64,
    pub miss_lru: u64,
    pub miss: u64,
    pub recently_evicted_miss: u64,
}

impl CacheMetrics {
    pub fn total_hits(&self) -> u64 {
        self.hit_mfa + self.hit_lru
    }

    pub fn total_gets(&self) -> u64 {
        self.hit_mfa + self.hit_lru + self.miss
    }
}

struct EvictRing {
    order: VecDeque<Box<str>>,
    set: HashSet<Box<str>>,
    cap: usize,
}

impl EvictRing {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
            cap,
        }
    }

    fn record(&mut self, key: &str) {
        if self.cap == 0 {
            return;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(key.into());
        self.set.insert(key.into());
    }

    fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }
}

struct Inner<V> {
    lru: Store<V>,
    mfa: Store<V>,
    clock: LogicalClock,
    metrics: CacheMetrics,
    evict_ring: Option<EvictRing>,
}

/// A bounded LRU+MFA cache, serialized by a single mutex (§4.B: cache ops
/// are O(log n) on small in-memory heaps, so one lock keeps the
/// promotion/demotion protocol legible without per-store coherence bugs).
pub struct Cache<V> {
    inner: Mutex<Inner<V>>,
    cap: usize,
    noop: bool,
}

impl<V: Clone> Cache<V> {
    /// `cap == 0` builds a no-op cache (every `get` misses, every `put`
    /// drops). `cap == 1` is rejected — a one-slot LRU+MFA split can't hold
    /// both stores meaningfully. `evict_metrics_ring` sizes the
    /// recently-evicted-key ring; `None` disables that mode.
    pub fn new(cap: usize, evict_metrics_ring: Option<usize>) -> Result<Self> {
        if cap == 1 {
            return Err(ForwarderError::Config(
                "cache capacity must be 0 (disabled) or >= 2".into(),
            ));
        }
        let noop = cap == 0;
        let lru_cap = cap / 2;
        let mfa_cap = cap - lru_cap;
        let inner = Inner {
            lru: Store::new(OrderMode::ByTime, lru_cap),
            mfa: Store::new(OrderMode::ByAccesses, mfa_cap),
            clock: LogicalClock::new(),
            metrics: CacheMetrics::default(),
            evict_ring: evict_metrics_ring.map(EvictRing::new),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            cap,
            noop,
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        inner.lru.len() + inner.mfa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().expect("cache mutex poisoned").metrics
    }

    fn tick(inner: &mut Inner<V>) -> u64 {
        let (now, wrapped) = inner.clock.tick();
        if wrapped {
            let a = inner.lru.reset(0);
            let b = inner.mfa.reset(0);
            // Both reset()s report the next clock value that is safe to
            // resume from; take the larger so neither store's freshly
            // assigned `t`s are immediately revisited. The operation that
            // triggered the wraparound must itself be stamped with a `t`
            // past that point, not with the wrapped `0` — otherwise it
            // ties with the oldest just-reassigned LRU survivor instead of
            // being the freshest touch.
            for _ in 0..a.max(b) {
                inner.clock.tick();
            }
            return inner.clock.current();
        }
        now
    }

    /// Check MFA first, then LRU. Returns `(value, hit)`.
    pub fn get(&self, key: &str) -> (Option<V>, bool) {
        if self.noop {
            return (None, false);
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Self::tick(&mut inner);

        if let Some(v) = inner.mfa.get(now, key) {
            inner.metrics.hit_mfa += 1;
            return (Some(v), true);
        }
        inner.metrics.miss_mfa += 1;

        if let Some(v) = inner.lru.get(now, key) {
            inner.metrics.hit_lru += 1;
            return (Some(v), true);
        }
        inner.metrics.miss_lru += 1;
        inner.metrics.miss += 1;

        if let Some(ring) = inner.evict_ring.as_ref() {
            if ring.contains(key) {
                inner.metrics.recently_evicted_miss += 1;
            }
        }
        (None, false)
    }

    /// Runs the §4.B insertion protocol: update-in-place if present in
    /// either store, otherwise insert into LRU and carry any eviction
    /// through the promotion/demotion cascade into MFA.
    pub fn put(&self, key: &str, value: V) {
        if self.noop {
            return;
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Self::tick(&mut inner);

        // 1/2: update-in-place wins in either store.
        let value = match inner.mfa.update(now, key, value) {
            None => return,
            Some(v) => v,
        };
        let value = match inner.lru.update(now, key, value) {
            None => return,
            Some(v) => v,
        };

        // 3: fresh insert into LRU.
        let evicted = match inner.lru.put(now, key, value, 1) {
            PutOutcome::Inserted | PutOutcome::Updated => return,
            PutOutcome::Evicted(item) => item,
        };

        // 4: the item just evicted from LRU is considered for MFA.
        if !inner.mfa.is_full() {
            // 4a
            match inner.mfa.put(now, &evicted.key, evicted.value, evicted.a) {
                PutOutcome::Inserted => {}
                // mfa wasn't actually full; nothing else to reconcile.
                PutOutcome::Updated | PutOutcome::Evicted(_) => {}
            }
            return;
        }

        let mfa_min_dominates = match inner.mfa.peek() {
            Some(min) => {
                min.a > evicted.a || (min.a == evicted.a && min.t > evicted.t)
            }
            None => false,
        };

        if mfa_min_dominates {
            // 4b: E doesn't earn a spot in a full MFA. Drop it.
            if let Some(ring) = inner.evict_ring.as_mut() {
                ring.record(&evicted.key);
            }
            return;
        }

        // 4c: E displaces MFA's minimum.
        let displaced = match inner.mfa.put(now, &evicted.key, evicted.value, evicted.a) {
            PutOutcome::Evicted(item) => item,
            PutOutcome::Inserted | PutOutcome::Updated => {
                unreachable!("mfa was full and E beat its minimum; put must evict")
            }
        };

        let lru_peek_a = inner.lru.peek().map(|i| i.a);
        let f_deserves_lru = inner.lru.is_empty() || lru_peek_a.is_some_and(|a| displaced.a >= a);

        if f_deserves_lru {
            if let PutOutcome::Evicted(g) = inner.lru.put(now, &displaced.key, displaced.value, 1) {
                // G is a second-order eviction; drop and record.
                if let Some(ring) = inner.evict_ring.as_mut() {
                    ring.record(&g.key);
                }
            }
        } else if let Some(ring) = inner.evict_ring.as_mut() {
            ring.record(&displaced.key);
        }
    }
}
