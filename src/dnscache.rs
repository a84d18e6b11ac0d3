//! DNS-aware wrapper around [`Cache`]: question fingerprinting, TTL
//! clamping/rewriting, and the soft-expiry ("serve stale, refresh in the
//! background") policy.

use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use tracing::trace;

use crate::cache::Cache;
use crate::clock::CoarseClock;

/// An immutable cached response plus its absolute expiry.
///
/// The transaction ID is deliberately not part of this value — it's
/// rewritten per lookup to match whichever client query is being served.
#[derive(Clone)]
pub struct CachedMessage {
    message: Message,
    exp: Instant,
}

/// TTL policy: floors (and optionally caps) what's handed back to clients,
/// independent of what upstream actually returned.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min_ttl: u32,
    pub max_ttl: u32,
    /// TTL written onto every answer of a soft-expired hit.
    pub stale_ttl: u32,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            min_ttl: 60,
            max_ttl: i32::MAX as u32,
            stale_ttl: 60,
        }
    }
}

/// Canonical text fingerprint of a message's first question: the cache key.
///
/// Two messages with the same name/class/type share a key regardless of
/// transport or transaction ID. Returns `None` for a message with no
/// question section — such a message is never cacheable.
pub fn fingerprint(msg: &Message) -> Option<String> {
    let q = msg.queries().first()?;
    let name = q.name().to_string();
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    Some(format!("{name}/{}/{}", q.query_class(), q.query_type()))
}

fn rewrite_ttls(message: &mut Message, ttl: u32) {
    for answer in message.answers_mut() {
        answer.set_ttl(ttl);
    }
}

/// DNS-question-keyed cache built on the generic LRU+MFA [`Cache`].
pub struct DnsCache {
    cache: Cache<CachedMessage>,
    policy: TtlPolicy,
    clock: std::sync::Arc<CoarseClock>,
}

impl DnsCache {
    pub fn new(
        cap: usize,
        evict_metrics_ring: Option<usize>,
        policy: TtlPolicy,
        clock: std::sync::Arc<CoarseClock>,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            cache: Cache::new(cap, evict_metrics_ring)?,
            policy,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn cap(&self) -> usize {
        self.cache.cap()
    }

    pub fn metrics(&self) -> crate::cache::CacheMetrics {
        self.cache.metrics()
    }

    /// `(response, fresh?)`. `fresh = false` on a soft-expired hit means
    /// the caller should serve the (short-TTL) response and also enqueue a
    /// background refresh; it also means `false` on an outright miss.
    pub async fn get(&self, query: &Message) -> (Option<Message>, bool) {
        let Some(key) = fingerprint(query) else {
            return (None, false);
        };
        let (cached, hit) = self.cache.get(&key);
        if !hit {
            return (None, false);
        }
        let Some(cached) = cached else {
            return (None, false);
        };

        let mut message = cached.message.clone();
        message.set_id(query.id());

        let now = self.clock.now().await;
        if cached.exp < now {
            trace!(key = %key, "soft-expired cache hit, serving stale");
            rewrite_ttls(&mut message, self.policy.stale_ttl);
            return (Some(message), false);
        }

        let remaining = cached.exp.saturating_duration_since(now).as_secs();
        let ttl = (remaining as u32).clamp(self.policy.min_ttl, self.policy.max_ttl);
        rewrite_ttls(&mut message, ttl);
        (Some(message), true)
    }

    /// Never caches a non-`NOERROR` response or one with no answers (there
    /// is no TTL to derive an expiry from).
    pub async fn put(&self, query: &Message, response: &Message) {
        if response.response_code() != ResponseCode::NoError {
            return;
        }
        let Some(key) = fingerprint(query) else {
            return;
        };
        let Some(min_ttl) = response.answers().iter().map(|a| a.ttl()).min() else {
            return;
        };
        let ttl = min_ttl.max(self.policy.min_ttl);

        let mut message = response.clone();
        message.set_truncated(false);
        // Wire-compression is a serialization-time concern (applied by the
        // listener's encoder), not a property of the in-memory `Message`.

        let now = self.clock.now().await;
        let exp = now + Duration::from_secs(ttl as u64);
        self.cache.put(&key, CachedMessage { message, exp });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::time::Duration;

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn answer(name: &str, ttl: u32, rcode: ResponseCode) -> Message {
        let mut msg = query(name);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(rcode);
        if rcode == ResponseCode::NoError {
            let record = Record::from_rdata(
                Name::from_str(name).unwrap(),
                ttl,
                RData::A(A::new(42, 42, 42, 42)),
            );
            msg.add_answer(record);
        }
        msg
    }

    async fn test_cache(min_ttl: u32) -> DnsCache {
        let (clock, _handle) = CoarseClock::spawn(Duration::from_millis(50));
        let policy = TtlPolicy {
            min_ttl,
            ..Default::default()
        };
        DnsCache::new(8, None, policy, clock).unwrap()
    }

    #[tokio::test]
    async fn round_trip_preserves_answer_modulo_id_and_ttl() {
        let cache = test_cache(60).await;
        let q = query("raccoon.miki.");
        let r = answer("raccoon.miki.", 10, ResponseCode::NoError);
        cache.put(&q, &r).await;

        let (hit, fresh) = cache.get(&q).await;
        let hit = hit.expect("must be cached");
        assert!(fresh);
        assert_eq!(hit.id(), q.id());
        assert!(hit.answers()[0].ttl() >= 60); // clamped to min_ttl
    }

    #[tokio::test]
    async fn non_noerror_is_never_cached() {
        let cache = test_cache(60).await;
        let q = query("fail.example.");
        let r = answer("fail.example.", 10, ResponseCode::ServFail);
        cache.put(&q, &r).await;
        let (hit, _) = cache.get(&q).await;
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn soft_expired_hit_rewrites_ttl_and_reports_stale() {
        let cache = test_cache(1).await;
        let q = query("soon.example.");
        let r = answer("soon.example.", 1, ResponseCode::NoError);
        cache.put(&q, &r).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let (hit, fresh) = cache.get(&q).await;
        let hit = hit.expect("stale entries still serve a response");
        assert!(!fresh);
        assert_eq!(hit.answers()[0].ttl(), 60);
    }

    #[test]
    fn fingerprint_ignores_case_and_trailing_dot() {
        let a = fingerprint(&query("Example.COM.")).unwrap();
        let b = fingerprint(&query("example.com")).unwrap();
        assert_eq!(a, b);
    }
}
