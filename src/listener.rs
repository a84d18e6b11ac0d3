//! Listener/dispatcher (§4.F): UDP + TCP accept loops, dispatch to the
//! engine, SERVFAIL synthesis on failure, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{ForwarderError, Result};
use crate::pool::Dialer;

/// Practical ceiling for a UDP DNS datagram. Larger queries (EDNS0) are
/// rejected by the upstream pool layer anyway since this crate does no
/// EDNS manipulation (§1 non-goals); 4096 covers every realistic client.
const MAX_UDP_DATAGRAM: usize = 4096;

fn synthesize_servfail(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Opens UDP and TCP listeners on `addr` and dispatches every incoming
/// query to `engine` until `shutdown` is triggered.
pub async fn serve<D: Dialer + 'static>(
    addr: SocketAddr,
    engine: Arc<Engine<D>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let udp = UdpSocket::bind(addr)
        .await
        .map_err(|source| ForwarderError::Bind { addr, source })?;
    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|source| ForwarderError::Bind { addr, source })?;
    info!(%addr, "listening for DNS queries (udp+tcp)");

    let udp = Arc::new(udp);
    let udp_task = {
        let udp = udp.clone();
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { serve_udp(udp, engine, shutdown).await })
    };
    let tcp_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { serve_tcp(tcp, engine, shutdown).await })
    };

    let _ = tokio::join!(udp_task, tcp_task);
    info!("listener shut down");
    Ok(())
}

async fn serve_udp<D: Dialer + 'static>(
    socket: Arc<UdpSocket>,
    engine: Arc<Engine<D>>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    continue;
                }
            },
        };

        let query = match Message::from_bytes(&buf[..len]) {
            Ok(q) => q,
            Err(e) => {
                debug!(%peer, error = %e, "dropping unparseable udp query");
                continue;
            }
        };

        let socket = socket.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let response = resolve_or_servfail(&engine, &query).await;
            match response.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        warn!(%peer, error = %e, "udp write failed, dropping");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode udp response"),
            }
        });
    }
}

async fn serve_tcp<D: Dialer + 'static>(
    listener: TcpListener,
    engine: Arc<Engine<D>>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            },
        };

        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, engine, shutdown).await {
                debug!(%peer, error = %e, "tcp connection ended");
            }
        });
    }
}

/// A single TCP client can pipeline multiple queries on one connection per
/// RFC 1035's 2-byte length-prefixed framing; loop until the peer closes.
async fn handle_tcp_connection<D: Dialer + 'static>(
    mut stream: TcpStream,
    engine: Arc<Engine<D>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = stream.read_exact(&mut len_buf) => result?,
        };
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        let query = match Message::from_bytes(&buf) {
            Ok(q) => q,
            Err(e) => {
                debug!(error = %e, "dropping unparseable tcp query, closing connection");
                return Ok(());
            }
        };

        let response = resolve_or_servfail(&engine, &query).await;
        let bytes = response
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let out_len = u16::try_from(bytes.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "response too large"))?;
        stream.write_all(&out_len.to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
    }
}

async fn resolve_or_servfail<D: Dialer + 'static>(engine: &Engine<D>, query: &Message) -> Message {
    match engine.resolve(query).await {
        Some(response) => response,
        None => synthesize_servfail(query),
    }
}
