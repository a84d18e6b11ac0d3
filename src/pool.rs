//! Bounded reusable DoT connection buffer with lazy dial (§4.D).
//!
//! Each upstream gets one [`Pool`]. A `get()` returns a buffered connection
//! if one is ready, otherwise dials fresh. A `put()` returns a still-good
//! connection to the buffer, or closes it if the buffer is already full.
//! Connections are never health-checked proactively — a failed I/O is the
//! only signal the caller needs, and a failed connection is simply not
//! returned to the pool.
//!
//! The pool is generic over the connection type so tests can plug in an
//! in-memory duplex stream instead of a real TLS handshake; production
//! wiring fixes it to [`TlsConn`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ForwarderError, Result};
use crate::upstream::{resolve_dial_addr, Upstream};

/// Production connection type: a TLS stream over a TCP socket.
pub type TlsConn = TlsStream<TcpStream>;

/// Abstracts "produce a fresh connection to this upstream" so tests can
/// substitute an in-process mock dialer instead of a real TLS handshake.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self, upstream: &Upstream) -> Result<Self::Conn>;
}

/// TLS ≥ 1.2 dialer using the platform-independent `rustls` + `webpki-roots`
/// stack (no OpenSSL / native cert-store dependency). TLS 1.3 is preferred
/// and offered first by `rustls`'s default cipher suite ordering.
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> Self {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
        };
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Conn = TlsConn;

    async fn dial(&self, upstream: &Upstream) -> Result<Self::Conn> {
        let addr = resolve_dial_addr(upstream)?;
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ForwarderError::Upstream {
                upstream: upstream.dial_addr(),
                reason: format!("tcp connect failed: {e}"),
            })?;
        tcp.set_nodelay(true).ok();

        let name = ServerName::try_from(upstream.sni.clone()).map_err(|_| {
            ForwarderError::Config(format!("invalid SNI hostname {:?}", upstream.sni))
        })?;
        let tls = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(|e| ForwarderError::Upstream {
                upstream: upstream.dial_addr(),
                reason: format!("tls handshake failed: {e}"),
            })?;
        debug!(upstream = %upstream.sni, "dialed new DoT connection");
        Ok(tls)
    }
}

struct Inner<C> {
    buffer: Vec<C>,
    closed: bool,
}

/// A bounded buffer of ready connections to one upstream.
pub struct Pool<D: Dialer> {
    upstream: Upstream,
    dialer: D,
    cap: usize,
    inner: Mutex<Inner<D::Conn>>,
    shut_down: AtomicBool,
}

impl<D: Dialer> Pool<D> {
    pub fn new(upstream: Upstream, dialer: D, cap: usize) -> Self {
        Self {
            upstream,
            dialer,
            cap,
            inner: Mutex::new(Inner {
                buffer: Vec::with_capacity(cap),
                closed: false,
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Return a buffered connection if any; otherwise dial a new one.
    /// Fails if the pool has been shut down.
    pub async fn get(&self) -> Result<D::Conn> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ForwarderError::PoolShutDown(self.upstream.sni.clone()));
        }
        {
            let mut inner = self.inner.lock().await;
            if let Some(conn) = inner.buffer.pop() {
                return Ok(conn);
            }
        }
        self.dialer.dial(&self.upstream).await
    }

    /// Return a still-good connection to the buffer, or drop (close) it if
    /// the buffer has no room or the pool is shut down.
    pub async fn put(&self, conn: D::Conn) {
        if self.shut_down.load(Ordering::Acquire) {
            return; // dropping `conn` closes it
        }
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.buffer.len() >= self.cap {
            return; // dropping `conn` closes it
        }
        inner.buffer.push(conn);
    }

    /// Atomically mark closed, drain and close every buffered connection.
    /// Future `get`/`put` become no-ops (`get` errors, `put` drops).
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let drained = std::mem::take(&mut inner.buffer);
        drop(inner);
        debug!(upstream = %self.upstream.sni, drained = drained.len(), "pool shut down");
        // Dropping `drained` closes every buffered connection.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    fn test_upstream() -> Upstream {
        Upstream {
            dial_host: "127.0.0.1".into(),
            port: 853,
            sni: "example".into(),
        }
    }

    /// Dials a fresh in-memory duplex pair each call, and counts dials.
    struct MockDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        type Conn = DuplexStream;

        async fn dial(&self, _upstream: &Upstream) -> Result<Self::Conn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(64);
            Ok(a)
        }
    }

    #[tokio::test]
    async fn get_dials_when_buffer_empty() {
        let dialer = MockDialer { dials: AtomicUsize::new(0) };
        let pool = Pool::new(test_upstream(), dialer, 2);
        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_then_get_reuses_the_buffered_connection_without_redialing() {
        let dialer = MockDialer { dials: AtomicUsize::new(0) };
        let pool = Pool::new(test_upstream(), dialer, 2);
        let conn = pool.get().await.unwrap();
        pool.put(conn).await;
        let _conn2 = pool.get().await.unwrap();
        assert_eq!(pool.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_beyond_capacity_drops_the_connection() {
        let dialer = MockDialer { dials: AtomicUsize::new(0) };
        let pool = Pool::new(test_upstream(), dialer, 1);
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a).await;
        pool.put(b).await; // buffer already has one; this one is dropped
        assert_eq!(pool.inner.lock().await.buffer.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_buffer_and_fails_future_get() {
        let dialer = MockDialer { dials: AtomicUsize::new(0) };
        let pool = Pool::new(test_upstream(), dialer, 2);
        let conn = pool.get().await.unwrap();
        pool.put(conn).await;
        pool.shutdown().await;
        assert_eq!(pool.inner.lock().await.buffer.len(), 0);
        assert!(pool.get().await.is_err());
    }

    #[tokio::test]
    async fn put_after_shutdown_is_a_silent_drop() {
        let dialer = MockDialer { dials: AtomicUsize::new(0) };
        let pool = Pool::new(test_upstream(), dialer, 2);
        pool.shutdown().await;
        let (a, _b) = tokio::io::duplex(64);
        pool.put(a).await;
        assert_eq!(pool.inner.lock().await.buffer.len(), 0);
    }
}
