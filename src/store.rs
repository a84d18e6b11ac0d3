//! A bounded-capacity keyed priority queue, used in two modes by the cache
//! above it: `ByTime` (LRU) and `ByAccesses` (MFA).
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Store<V>                          │
//! │                                                             │
//! │   Vec<Item<V>>  (array-backed binary min-heap)             │
//! │   ┌───┬───┬───┬───┬───┐                                    │
//! │   │ 0 │ 1 │ 2 │ 3 │ 4 │  ...                                │
//! │   └───┴───┴───┴───┴───┘                                    │
//! │     ▲                                                      │
//! │     │  key → index                                         │
//! │   HashMap<Box<str>, usize>                                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The heap gives O(log n) insert/evict; the parallel index map lets any
//! keyed item be found and re-heapified in place (a touch on a hit doesn't
//! need to scan the heap) — the two structures are kept in sync on every
//! swap, push, and pop.

use std::collections::HashMap;

/// Which field the heap is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    /// LRU: order by logical time `t`, tie-break on access count `a`
    /// (lower `a` is more evictable when `t` ties).
    ByTime,
    /// MFA: order by access count `a`, tie-break on logical time `t`
    /// (older `t` is more evictable when `a` ties).
    ByAccesses,
}

/// One resident item: a key, its value, and the two ordering fields.
#[derive(Debug, Clone)]
pub struct Item<V> {
    pub key: Box<str>,
    pub value: V,
    /// Logical time of last touch (insertion or `get` hit).
    pub t: u64,
    /// Access count since insertion. Always `>= 1`.
    pub a: u64,
}

/// Outcome of [`Store::put`].
pub enum PutOutcome<V> {
    /// Key was already present; its value/`t`/`a` were updated in place.
    Updated,
    /// Key was absent and the store had room; inserted with no eviction.
    Inserted,
    /// Key was absent and the store was full. Either the previous minimum
    /// was evicted to make room for the candidate, or the candidate itself
    /// "bounced" (the store was unchanged) because it was strictly smaller
    /// than the current minimum under this store's ordering. Either way,
    /// the caller gets back whichever item did not end up resident.
    Evicted(Item<V>),
}

/// A bounded-capacity keyed priority queue ordered by [`OrderMode`].
pub struct Store<V> {
    mode: OrderMode,
    cap: usize,
    heap: Vec<Item<V>>,
    index: HashMap<Box<str>, usize>,
}

impl<V> Store<V> {
    pub fn new(mode: OrderMode, cap: usize) -> Self {
        Self {
            mode,
            cap,
            heap: Vec::with_capacity(cap.min(1024)),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.cap
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// The current minimum under this store's ordering. Never mutates.
    pub fn peek(&self) -> Option<&Item<V>> {
        self.heap.first()
    }

    /// `a < b` under this store's ordering (`a` is more evictable).
    ///
    /// Ties on the primary+tiebreak fields fall back to comparing keys, so
    /// `less(x, y) == !less(y, x)` holds for any two distinct items — the
    /// spec's strict-ordering property would otherwise fail for items that
    /// share both `t` and `a` (e.g. two entries inserted in the same tick).
    fn less(&self, x: &Item<V>, y: &Item<V>) -> bool {
        let primary = match self.mode {
            OrderMode::ByTime => x.t.cmp(&y.t).then_with(|| x.a.cmp(&y.a)),
            OrderMode::ByAccesses => x.a.cmp(&y.a).then_with(|| x.t.cmp(&y.t)),
        };
        primary.then_with(|| x.key.cmp(&y.key)).is_lt()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].key.clone(), i);
        self.index.insert(self.heap[j].key.clone(), j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.less(&self.heap[i], &self.heap[parent]) {
                self.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let l = 2 * i + 1;
            let r = 2 * i + 2;
            let mut smallest = i;
            if l < n && self.less(&self.heap[l], &self.heap[smallest]) {
                smallest = l;
            }
            if r < n && self.less(&self.heap[r], &self.heap[smallest]) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn push(&mut self, item: Item<V>) {
        let i = self.heap.len();
        self.index.insert(item.key.clone(), i);
        self.heap.push(item);
        self.sift_up(i);
    }

    /// Remove and return the current minimum.
    fn pop_min(&mut self) -> Option<Item<V>> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let item = self.heap.pop().expect("checked non-empty above");
        self.index.remove(&item.key);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(item)
    }

    /// `get(now, key)`: on hit, touches `t ← now`, `a ← a + 1`, re-heapifies.
    pub fn get(&mut self, now: u64, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let &i = self.index.get(key)?;
        self.heap[i].t = now;
        self.heap[i].a += 1;
        // `t`/`a` only ever move the item toward being "less evictable" for
        // its own store's dominant field, but the tiebreak can cut either
        // way, so re-run both directions to stay correct.
        self.sift_down(i);
        let i = self.index[key];
        self.sift_up(i);
        Some(self.heap[self.index[key]].value.clone())
    }

    /// `put(now, key, value, start_count)`. See [`PutOutcome`] for the
    /// eviction/bounce distinction.
    pub fn put(&mut self, now: u64, key: &str, value: V, start_count: u64) -> PutOutcome<V> {
        if let Some(&i) = self.index.get(key) {
            self.heap[i].value = value;
            self.heap[i].t = now;
            self.heap[i].a += start_count;
            self.sift_down(i);
            let i = self.index[key];
            self.sift_up(i);
            return PutOutcome::Updated;
        }

        let candidate = Item {
            key: key.into(),
            value,
            t: now,
            a: start_count.max(1),
        };

        if !self.is_full() {
            self.push(candidate);
            return PutOutcome::Inserted;
        }

        // Full: bounce the candidate if it would be strictly smaller than
        // the current minimum, otherwise evict the minimum and insert.
        let bounces = match self.peek() {
            Some(min) => self.less(&candidate, min),
            None => false, // cap == 0: nothing to compare against, falls through below
        };
        if self.cap == 0 {
            return PutOutcome::Evicted(candidate);
        }
        if bounces {
            PutOutcome::Evicted(candidate)
        } else {
            let evicted = self.pop_min().expect("is_full implies non-empty when cap > 0");
            self.push(candidate);
            PutOutcome::Evicted(evicted)
        }
    }

    /// Touch-and-update only if present; never inserts.
    ///
    /// Returns `None` if the key was present (the value was consumed in
    /// place), or hands `value` back unused as `Some` if the key was
    /// absent — callers chaining multiple stores' `update` calls with the
    /// same candidate need their value back on a miss.
    pub fn update(&mut self, now: u64, key: &str, value: V) -> Option<V> {
        let Some(&i) = self.index.get(key) else {
            return Some(value);
        };
        self.heap[i].value = value;
        self.heap[i].t = now;
        self.heap[i].a += 1;
        self.sift_down(i);
        let i = self.index[key];
        self.sift_up(i);
        None
    }

    /// Look up an item without mutating its ordering fields.
    #[cfg(test)]
    pub(crate) fn item(&self, key: &str) -> Option<&Item<V>> {
        let &i = self.index.get(key)?;
        Some(&self.heap[i])
    }

    /// Prepare for a logical-clock wraparound. Returns the clock value the
    /// owner should resume ticking from so freshly assigned `t`s are never
    /// revisited.
    ///
    /// `ByTime`: every item is popped in ascending order and reassigned a
    /// dense, strictly increasing `t` starting at `start` — the cheapest way
    /// to keep `t` meaningful as a tiebreak while guaranteeing uniqueness.
    /// `ByAccesses`: `t` is secondary to `a` here, so every item's `t` is
    /// simply zeroed; relative order among distinct `a`s is unaffected.
    pub fn reset(&mut self, start: u64) -> u64 {
        match self.mode {
            OrderMode::ByTime => {
                let mut items = Vec::with_capacity(self.heap.len());
                while let Some(item) = self.pop_min() {
                    items.push(item);
                }
                let mut next = start;
                for item in items.iter_mut() {
                    item.t = next;
                    next += 1;
                }
                self.heap.clear();
                self.index.clear();
                for item in items {
                    self.push(item);
                }
                next
            }
            OrderMode::ByAccesses => {
                for item in self.heap.iter_mut() {
                    item.t = 0;
                }
                // Zeroing `t` uniformly cannot change any `less` outcome
                // that didn't already tie on `a`, but rebuild the heap
                // anyway since tie order among equal-`a` items may shift.
                for i in (0..self.heap.len() / 2).rev() {
                    self.sift_down(i);
                }
                self.index.clear();
                for (i, item) in self.heap.iter().enumerate() {
                    self.index.insert(item.key.clone(), i);
                }
                start
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lru(cap: usize) -> Store<i32> {
        Store::new(OrderMode::ByTime, cap)
    }

    fn mfa(cap: usize) -> Store<i32> {
        Store::new(OrderMode::ByAccesses, cap)
    }

    #[test]
    fn fresh_put_is_immediately_gettable() {
        let mut s = lru(4);
        assert!(matches!(s.put(1, "a", 10, 1), PutOutcome::Inserted));
        assert_eq!(s.get(2, "a"), Some(10));
    }

    #[test]
    fn len_never_exceeds_cap() {
        let mut s = lru(2);
        for (t, k) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            s.put(t, k, 0, 1);
            assert!(s.len() <= s.cap());
        }
    }

    #[test]
    fn no_eviction_sequence_preserves_last_value() {
        let mut s = lru(8);
        s.put(1, "a", 1, 1);
        s.put(2, "a", 2, 1);
        assert_eq!(s.get(3, "a"), Some(2));
    }

    #[test]
    fn byaccesses_orders_by_count_then_age() {
        let mut s = mfa(8);
        s.put(1, "a", 0, 1);
        s.put(2, "b", 0, 1);
        s.get(3, "a"); // a now has 2 accesses, b has 1
        assert_eq!(s.peek().unwrap().key.as_ref(), "b");
    }

    #[test]
    fn bytime_full_store_bounces_older_candidate() {
        let mut s = lru(1);
        s.put(5, "old", 1, 1);
        match s.put(1, "new", 2, 1) {
            PutOutcome::Evicted(item) => assert_eq!(item.key.as_ref(), "new"),
            _ => panic!("expected a bounce"),
        }
        // Store is unchanged: "old" is still resident.
        assert_eq!(s.get(6, "old"), Some(1));
        assert!(!s.contains("new"));
    }

    #[test]
    fn bytime_full_store_evicts_minimum_for_newer_candidate() {
        let mut s = lru(1);
        s.put(1, "old", 1, 1);
        match s.put(5, "new", 2, 1) {
            PutOutcome::Evicted(item) => assert_eq!(item.key.as_ref(), "old"),
            _ => panic!("expected an eviction"),
        }
        assert_eq!(s.get(6, "new"), Some(2));
    }

    #[test]
    fn less_is_antisymmetric_for_distinct_items() {
        let s = lru(8);
        let a = Item { key: "a".into(), value: 0, t: 3, a: 1 };
        let b = Item { key: "b".into(), value: 0, t: 3, a: 1 };
        assert_ne!(s.less(&a, &b), s.less(&b, &a));
    }

    #[test]
    fn reset_bytime_preserves_pop_order() {
        let mut s = lru(4);
        s.put(10, "a", 0, 1);
        s.put(20, "b", 0, 1);
        s.put(30, "c", 0, 1);
        let before: Vec<_> = {
            let mut clone_keys = vec![];
            let mut tmp = Store::new(OrderMode::ByTime, 4);
            std::mem::swap(&mut tmp, &mut s);
            while let Some(item) = tmp.pop_min() {
                clone_keys.push(item.key.clone());
            }
            clone_keys
        };
        let mut s2 = lru(4);
        s2.put(10, "a", 0, 1);
        s2.put(20, "b", 0, 1);
        s2.put(30, "c", 0, 1);
        s2.reset(0);
        let mut after = vec![];
        while let Some(item) = s2.pop_min() {
            after.push(item.key.clone());
        }
        assert_eq!(before, after);
    }

    #[test]
    fn update_does_not_insert_absent_key() {
        let mut s = lru(4);
        assert_eq!(s.update(1, "missing", 5), Some(5));
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn cap_zero_always_bounces() {
        let mut s = lru(0);
        match s.put(1, "a", 1, 1) {
            PutOutcome::Evicted(item) => assert_eq!(item.key.as_ref(), "a"),
            _ => panic!("cap=0 store must never accept an insert"),
        }
        assert_eq!(s.len(), 0);
    }
}
