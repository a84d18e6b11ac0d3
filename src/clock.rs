//! Two distinct notions of time used across the forwarder.
//!
//! [`LogicalClock`] is the unsigned, monotonic tick counter the cache (§4.B)
//! hands down into the priority stores (§4.A) — it has no relation to wall
//! time and exists purely to order insertions/accesses.
//!
//! [`CoarseClock`] is a ~1s-resolution wall-clock snapshot the forwarding
//! engine reads instead of calling `Instant::now()` on every query, saving a
//! syscall in the hot path. A dedicated ticker task keeps it fresh.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Monotonic logical tick counter with spec-mandated wraparound behavior.
///
/// Not thread-safe by itself — the [`crate::cache::Cache`] that owns one
/// serializes all access through its own mutex, so a plain `u64` suffices.
#[derive(Debug, Default)]
pub struct LogicalClock {
    now: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self { now: 0 }
    }

    /// Construct a clock already sitting at `now`, for exercising
    /// wraparound behavior without ticking billions of times.
    #[cfg(test)]
    pub(crate) fn at(now: u64) -> Self {
        Self { now }
    }

    /// Advance the clock by one tick and return the new value.
    ///
    /// Returns `(now, wrapped)` where `wrapped` is `true` iff this tick
    /// overflowed back to zero — the caller (the cache) must then invoke
    /// `reset` on both stores per §4.A.
    pub fn tick(&mut self) -> (u64, bool) {
        match self.now.checked_add(1) {
            Some(next) => {
                self.now = next;
                (self.now, false)
            }
            None => {
                self.now = 0;
                (self.now, true)
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.now
    }
}

/// A background-refreshed wall-clock snapshot.
///
/// All deadlines in this crate are seconds-scale, so a coarse, periodically
/// updated `Instant` is an acceptable substitute for a syscall per query.
pub struct CoarseClock {
    now: RwLock<Instant>,
}

impl CoarseClock {
    /// Spawn the ticker and return a handle alongside the clock itself.
    ///
    /// The ticker task runs until the returned `JoinHandle` is aborted or
    /// the process exits; callers that need graceful shutdown should abort
    /// it explicitly.
    pub fn spawn(period: Duration) -> (Arc<Self>, JoinHandle<()>) {
        let clock = Arc::new(Self {
            now: RwLock::new(Instant::now()),
        });
        let ticking = clock.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let mut guard = ticking.now.write().await;
                *guard = Instant::now();
            }
        });
        (clock, handle)
    }

    /// Read the most recent ticker snapshot.
    pub async fn now(&self) -> Instant {
        *self.now.read().await
    }
}
