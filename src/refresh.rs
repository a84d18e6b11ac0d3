//! Refresh worker (§4.G): a single long-lived task that re-resolves
//! soft-expired questions in the background without blocking a client.
//!
//! Backpressure policy: if the channel is full when a soft-expired hit
//! tries to enqueue a refresh, the refresh is dropped. The client already
//! got its (short-TTL) stale response; losing a refresh slot just means
//! the next query for that question pays a real upstream round trip
//! instead of getting a pre-warmed cache entry.
//!
//! **Open question (spec.md §9):** duplicate refreshes for the same
//! question are not coalesced — a burst of soft-expired queries for one
//! key can enqueue the same re-resolution multiple times. Flagged as a
//! possible enhancement, not silently fixed: deduplicating on key would
//! require a `HashSet<String>` alongside the channel, checked at enqueue
//! time and cleared when the refresh completes.

use hickory_proto::op::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Non-blocking enqueue handle held by the engine.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<Message>,
}

impl RefreshHandle {
    /// Enqueue a soft-expired query for background re-resolution. Drops
    /// the refresh (and logs at debug, not warn — this is an expected,
    /// harmless backpressure outcome) if the channel is full.
    pub fn enqueue(&self, query: Message) {
        match self.tx.try_send(query) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("refresh queue full, dropping refresh");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("refresh worker gone, dropping refresh");
            }
        }
    }
}

/// Spawns the refresh worker. Returns the handle engines enqueue onto, and
/// a `JoinHandle` callers abort during shutdown.
///
/// `resolve` is invoked once per dequeued query and should drive the same
/// forward+cache path the engine uses for a normal miss — this is
/// deliberately a closure rather than an `Engine` reference so the worker
/// doesn't need to know about pools, retries, or the engine's generic
/// dialer type parameter.
pub fn spawn<F, Fut>(capacity: usize, resolve: F) -> (RefreshHandle, tokio::task::JoinHandle<()>)
where
    F: Fn(Message) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (tx, mut rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move {
        while let Some(query) = rx.recv().await {
            debug!("refreshing soft-expired entry");
            resolve(query).await;
        }
    });
    (RefreshHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    #[tokio::test]
    async fn enqueued_refresh_is_driven_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let (handle, join) = spawn(4, move |_q| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        handle.enqueue(query("raccoon.miki."));
        // Give the worker a chance to drain the channel.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        join.abort();
    }

    #[tokio::test]
    async fn overflow_drops_refreshes_without_blocking_the_caller() {
        let (handle, join) = spawn(1, |_q| async {
            // Never finishes draining in time for this test — the point is
            // that `enqueue` itself never blocks even once the channel (and
            // the one in-flight slot) is full.
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        for _ in 0..10 {
            handle.enqueue(query("raccoon.miki."));
        }
        join.abort();
    }
}
