//! Crate-wide error type.
//!
//! Library modules (store, cache, pool, engine, listener) return
//! [`Result`]; `main.rs` layers `anyhow` on top at the process boundary.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the forwarder's library modules.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// Bad CLI/config input — rejected at startup, never at runtime.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to bind a listener socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An upstream dial, write, or read failed or timed out.
    #[error("upstream {upstream} unreachable: {reason}")]
    Upstream { upstream: String, reason: String },

    /// A per-query or per-dial deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An upstream answered, but with a non-cacheable rcode and no other
    /// upstream produced an acceptable answer.
    #[error("no acceptable answer (last rcode: {0:?})")]
    Protocol(hickory_proto::op::ResponseCode),

    /// Pool has been shut down; `get`/`put` are no-ops or errors.
    #[error("connection pool for {0} is shut down")]
    PoolShutDown(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] hickory_proto::ProtoError),
}

pub type Result<T> = std::result::Result<T, ForwarderError>;
