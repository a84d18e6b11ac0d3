//! Forwarding engine (§4.E): parallel race across upstream pools, retry,
//! per-query deadline, and the cache-check/refresh-enqueue entry point.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::dnscache::DnsCache;
use crate::error::ForwarderError;
use crate::pool::{Dialer, Pool};
use crate::refresh::RefreshHandle;

/// Tunables that would otherwise be magic numbers scattered through the
/// race/retry logic.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Per-`forward` deadline (§4.E: 10s default).
    pub connection_timeout: Duration,
    /// Additional attempts after the first `forward` yields nothing.
    /// Spec default: `K = pool_per_upstream_size`.
    pub retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            retries: 2,
        }
    }
}

/// Reads the RFC 1035 2-byte big-endian length prefix DoT uses over TCP,
/// then the message body. `?` relies on `ForwarderError`'s `#[from]`
/// conversions for both the I/O and wire-decode failure cases.
async fn read_message<C: tokio::io::AsyncRead + Unpin>(
    conn: &mut C,
) -> crate::error::Result<Message> {
    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await?;
    Ok(Message::from_bytes(&buf)?)
}

async fn write_message<C: tokio::io::AsyncWrite + Unpin>(
    conn: &mut C,
    msg: &Message,
) -> crate::error::Result<()> {
    let bytes = msg.to_bytes()?;
    let len = u16::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "message too large")
    })?;
    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(&bytes).await?;
    conn.flush().await?;
    Ok(())
}

fn is_acceptable(msg: &Message) -> bool {
    use hickory_proto::op::ResponseCode;
    matches!(
        msg.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

/// The race/retry/cache core, shared by [`Engine`] (client-facing, checks
/// the cache and enqueues refreshes) and the refresh worker (which drives
/// the same forward+cache path for a soft-expired query, without ever
/// touching the refresh queue itself).
///
/// Split out from `Engine` so the refresh worker can hold an `Arc<Resolver>`
/// without needing an `Engine` back-reference — `Engine` owns the
/// `RefreshHandle` it enqueues onto, and the refresh worker's closure owns
/// the `Resolver` it drains into; neither needs to see the other.
pub struct Resolver<D: Dialer> {
    pools: Vec<Arc<Pool<D>>>,
    cache: Arc<DnsCache>,
    config: EngineConfig,
}

impl<D: Dialer + 'static> Resolver<D> {
    pub fn new(pools: Vec<Arc<Pool<D>>>, cache: Arc<DnsCache>, config: EngineConfig) -> Self {
        Self {
            pools,
            cache,
            config,
        }
    }

    /// One pool's resolve attempt: checkout a connection, write the query,
    /// read a response. On any I/O error the connection is dropped (not
    /// returned to the pool); on success it's returned for reuse.
    ///
    /// Sends **exactly one** `Option<Message>` on `tx` before returning —
    /// this is the structural enforcement of the spec's open-question fix:
    /// a task's only exit point is the send.
    async fn resolve_one(
        pool: Arc<Pool<D>>,
        query: Message,
        deadline: Duration,
        tx: mpsc::Sender<Option<Message>>,
    ) {
        let result = Self::resolve_one_inner(&pool, &query, deadline).await;
        let _ = tx.send(result).await;
    }

    async fn resolve_one_inner(
        pool: &Pool<D>,
        query: &Message,
        deadline: Duration,
    ) -> Option<Message> {
        let mut conn = match pool.get().await {
            Ok(c) => c,
            Err(e) => {
                warn!(upstream = %pool.upstream().sni, error = %e, "pool get failed");
                return None;
            }
        };

        let io = async {
            write_message(&mut conn, query).await?;
            read_message(&mut conn).await
        };

        match tokio::time::timeout(deadline, io).await {
            Ok(Ok(response)) => {
                pool.put(conn).await;
                Some(response)
            }
            Ok(Err(e)) => {
                debug!(upstream = %pool.upstream().sni, error = %e, "resolve I/O error, dropping connection");
                drop(conn);
                None
            }
            Err(_elapsed) => {
                let err = ForwarderError::Timeout(deadline);
                debug!(upstream = %pool.upstream().sni, error = %err, "resolve timed out, dropping connection");
                drop(conn);
                None
            }
        }
    }

    /// Spawns one resolve task per pool, returns the first acceptable
    /// response, and cancels the rest. Returns `None` if every task fails
    /// to produce an acceptable response within `connection_timeout`.
    pub async fn forward(&self, query: &Message) -> Option<Message> {
        let deadline = self.config.connection_timeout;
        let (tx, mut rx) = mpsc::channel(self.pools.len().max(1));
        let mut tasks = JoinSet::new();
        for pool in &self.pools {
            let pool = pool.clone();
            let query = query.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                Self::resolve_one(pool, query, deadline, tx).await;
            });
        }
        drop(tx); // tasks hold their own senders; drop ours so rx closes once all finish

        let winner = tokio::time::timeout(deadline, async {
            let mut received = 0;
            while received < self.pools.len() {
                match rx.recv().await {
                    Some(Some(response)) if is_acceptable(&response) => return Some(response),
                    Some(Some(response)) => {
                        let err = ForwarderError::Protocol(response.response_code());
                        trace!(error = %err, "non-acceptable upstream response, trying the next one");
                        received += 1;
                    }
                    Some(None) => received += 1,
                    None => break,
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        tasks.abort_all();
        winner
    }

    /// `forward` with retries, writing a success back through the cache.
    /// Used both by [`Engine::resolve`] on a cache miss and by the refresh
    /// worker for a soft-expired query — neither path re-checks the cache
    /// first, since the caller has already decided a real upstream round
    /// trip is needed.
    pub async fn forward_and_cache(&self, query: &Message) -> Option<Message> {
        for attempt in 0..=self.config.retries {
            if let Some(response) = self.forward(query).await {
                self.cache.put(query, &response).await;
                return Some(response);
            }
            trace!(attempt, "forward produced nothing, retrying");
        }
        None
    }
}

/// Client-facing entry point: cache-check, then delegate to the shared
/// [`Resolver`] on a miss or a soft-expired hit.
pub struct Engine<D: Dialer> {
    resolver: Arc<Resolver<D>>,
    cache: Arc<DnsCache>,
    refresh: Option<RefreshHandle>,
}

impl<D: Dialer + 'static> Engine<D> {
    pub fn new(
        resolver: Arc<Resolver<D>>,
        cache: Arc<DnsCache>,
        refresh: Option<RefreshHandle>,
    ) -> Self {
        Self {
            resolver,
            cache,
            refresh,
        }
    }

    /// Resolve a client query. Returns `None` only when every attempt
    /// exhausted — the caller (listener) synthesizes SERVFAIL.
    pub async fn resolve(&self, query: &Message) -> Option<Message> {
        let (cached, fresh) = self.cache.get(query).await;
        if let Some(response) = cached {
            if fresh {
                return Some(response);
            }
            // Soft-expired: serve stale immediately, refresh in background.
            if let Some(refresh) = &self.refresh {
                refresh.enqueue(query.clone());
            }
            return Some(response);
        }

        self.resolver.forward_and_cache(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CoarseClock;
    use crate::dnscache::TtlPolicy;
    use crate::upstream::Upstream;
    use async_trait::async_trait;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, DuplexStream};

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn answer_for(query: &Message, ttl: u32, rcode: ResponseCode) -> Message {
        let mut msg = query.clone();
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(rcode);
        if rcode == ResponseCode::NoError {
            let q = &query.queries()[0];
            msg.add_answer(Record::from_rdata(
                q.name().clone(),
                ttl,
                RData::A(A::new(9, 9, 9, 9)),
            ));
        }
        msg
    }

    /// A dialer whose `dial` spawns a companion task that reads one query
    /// off the wire and writes back a canned response (optionally after a
    /// delay), simulating an upstream resolver over an in-memory duplex.
    struct ScriptedDialer {
        delay: Duration,
        rcode: ResponseCode,
        ttl: u32,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        type Conn = DuplexStream;

        async fn dial(&self, _upstream: &Upstream) -> crate::error::Result<Self::Conn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, mut server) = duplex(4096);
            let delay = self.delay;
            let rcode = self.rcode;
            let ttl = self.ttl;
            tokio::spawn(async move {
                let q = match read_message(&mut server).await {
                    Ok(q) => q,
                    Err(_) => return,
                };
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                let response = answer_for(&q, ttl, rcode);
                let _ = write_message(&mut server, &response).await;
            });
            Ok(client)
        }
    }

    fn test_pool(dialer: ScriptedDialer) -> Arc<Pool<ScriptedDialer>> {
        let upstream = Upstream {
            dial_host: "127.0.0.1".into(),
            port: 853,
            sni: "test".into(),
        };
        Arc::new(Pool::new(upstream, dialer, 2))
    }

    async fn test_cache() -> Arc<DnsCache> {
        let (clock, _handle) = CoarseClock::spawn(Duration::from_millis(50));
        Arc::new(DnsCache::new(64, None, TtlPolicy::default(), clock).unwrap())
    }

    #[tokio::test]
    async fn forward_returns_the_fast_upstreams_answer() {
        let fast = test_pool(ScriptedDialer {
            delay: Duration::ZERO,
            rcode: ResponseCode::NoError,
            ttl: 300,
            dials: AtomicUsize::new(0),
        });
        let slow = test_pool(ScriptedDialer {
            delay: Duration::from_secs(30),
            rcode: ResponseCode::NoError,
            ttl: 300,
            dials: AtomicUsize::new(0),
        });
        let cache = test_cache().await;
        let resolver = Resolver::new(
            vec![fast, slow],
            cache,
            EngineConfig {
                connection_timeout: Duration::from_millis(500),
                retries: 0,
            },
        );

        let start = std::time::Instant::now();
        let response = resolver.forward(&query("raccoon.miki.")).await;
        assert!(response.is_some());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn forward_returns_none_when_all_upstreams_fail() {
        let dead = test_pool(ScriptedDialer {
            delay: Duration::ZERO,
            rcode: ResponseCode::ServFail,
            ttl: 300,
            dials: AtomicUsize::new(0),
        });
        let cache = test_cache().await;
        let resolver = Resolver::new(
            vec![dead],
            cache,
            EngineConfig {
                connection_timeout: Duration::from_millis(200),
                retries: 0,
            },
        );
        let response = resolver.forward(&query("fail.example.")).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn resolve_caches_successful_answer_and_serves_second_query_from_cache() {
        let pool = test_pool(ScriptedDialer {
            delay: Duration::ZERO,
            rcode: ResponseCode::NoError,
            ttl: 300,
            dials: AtomicUsize::new(0),
        });
        let cache = test_cache().await;
        let resolver = Arc::new(Resolver::new(
            vec![pool.clone()],
            cache.clone(),
            EngineConfig {
                connection_timeout: Duration::from_secs(1),
                retries: 0,
            },
        ));
        let engine = Engine::new(resolver, cache.clone(), None);

        let q = query("raccoon.miki.");
        let first = engine.resolve(&q).await;
        assert!(first.is_some());
        assert_eq!(cache.metrics().miss, 1);

        let second = engine.resolve(&q).await;
        assert!(second.is_some());
        assert!(cache.metrics().total_hits() >= 1);
    }

    #[tokio::test]
    async fn resolve_returns_none_after_exhausting_retries() {
        let dead = test_pool(ScriptedDialer {
            delay: Duration::ZERO,
            rcode: ResponseCode::ServFail,
            ttl: 300,
            dials: AtomicUsize::new(0),
        });
        let cache = test_cache().await;
        let resolver = Arc::new(Resolver::new(
            vec![dead],
            cache.clone(),
            EngineConfig {
                connection_timeout: Duration::from_millis(100),
                retries: 1,
            },
        ));
        let engine = Engine::new(resolver, cache, None);
        let response = engine.resolve(&query("fail.example.")).await;
        assert!(response.is_none());
    }
}
