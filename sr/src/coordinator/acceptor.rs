//! Connection acceptor and per-connection read loop
//!
//! Each accepted stream gets its own task: handshake, acknowledgement,
//! registration, then framed reads until the peer goes away.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::RelayConfig;
use super::handle::RelayHandle;
use super::outbox::{Outbox, Writer};
use super::registry::{Endpoint, Registry};
use super::transport::{TcpTransport, Transport};
use crate::error::RelayError;
use crate::protocol::{FramedReader, Handshake, HandshakeAck, Message, encode_frame};

/// Shared state every connection task needs
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<RelayConfig>,
    pub registry: Registry,
    pub relay: RelayHandle,
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept connections until shutdown is signalled
///
/// The accept call wakes on `accept-timeout-ms` so a shutdown is noticed
/// even when nobody is connecting. A failed accept waits the same interval
/// before the next attempt.
pub async fn serve<L: Listener>(listener: L, ctx: ConnectionContext, shutdown_rx: watch::Receiver<bool>) {
    let accept_timeout = ctx.config.accept_timeout();
    debug!(?accept_timeout, "serve: called");

    loop {
        if *shutdown_rx.borrow() {
            info!("Acceptor stopping");
            break;
        }

        match tokio::time::timeout(accept_timeout, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, peer))) => {
                debug!(%peer, "serve: accepted connection");
                let ctx = ctx.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, ctx, shutdown_rx).await;
                });
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(accept_timeout).await;
            }
        }
    }
}

/// Placeholder name for peers that did not give one
pub fn placeholder_name(peer: &SocketAddr) -> String {
    format!("client_{}", peer.port())
}

/// Acknowledgement followed by the forced state reset, as one write
fn greeting(name: &str) -> Result<Vec<u8>, RelayError> {
    let mut frames = encode_frame(&HandshakeAck::ok(name))?;
    frames.extend(encode_frame(&Message::ResetState {})?);
    Ok(frames)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
    shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "handle_connection: set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        write_half,
        peer.to_string(),
        ctx.config.send_timeout(),
    ));
    let mut reader = FramedReader::new(read_half, ctx.config.max_frame_bytes);

    let handshake = match tokio::time::timeout(ctx.config.handshake_timeout(), reader.next_record::<Handshake>()).await
    {
        Ok(Ok(Ok(handshake))) => handshake,
        Ok(Ok(Err(e))) | Ok(Err(e)) => {
            warn!(%peer, error = %e, "Handshake rejected");
            transport.shutdown().await;
            return;
        }
        Err(_) => {
            warn!(%peer, "Handshake timed out");
            transport.shutdown().await;
            return;
        }
    };

    let name = handshake
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| placeholder_name(&peer));
    let role = handshake.role;
    info!(%peer, %name, %role, version = ?handshake.version, "Handshake accepted");

    let sent = match greeting(&name) {
        Ok(frames) => transport.send(&frames).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!(%peer, %name, error = %e, "Failed to acknowledge handshake");
        transport.shutdown().await;
        return;
    }

    let (outbox, inbox) = Outbox::channel(ctx.config.outbox_capacity);
    let endpoint = Endpoint::new(name.clone(), role, peer.to_string(), outbox);
    let connection_id = endpoint.connection_id;
    Writer::new(name.clone(), connection_id, Arc::clone(&transport), inbox, ctx.relay.clone()).spawn();
    if let Some(previous) = ctx.registry.register(endpoint) {
        info!(%name, previous = %previous.connection_id, "Replaced existing endpoint");
    }
    if ctx.relay.connected(&name, role).await.is_err() {
        debug!(%name, "handle_connection: relay gone");
    }

    read_loop(&mut reader, &name, &ctx, &shutdown_rx).await;

    let deregistered = ctx.registry.deregister_connection(&name, connection_id).is_some();
    if deregistered {
        transport.shutdown().await;
    }
    if ctx.relay.disconnected(&name, deregistered).await.is_err() {
        debug!(%name, "handle_connection: relay gone");
    }
}

async fn read_loop<R>(
    reader: &mut FramedReader<R>,
    name: &str,
    ctx: &ConnectionContext,
    shutdown_rx: &watch::Receiver<bool>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.next_record::<Message>().await {
            Ok(Ok(message)) => {
                if ctx.relay.inbound(name, message).await.is_err() {
                    debug!(%name, "read_loop: relay gone");
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!(%name, error = %e, "Skipping undecodable record");
            }
            Err(RelayError::PeerClosed) => {
                info!(%name, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(%name, error = %e, "Connection read failed");
                break;
            }
        }

        if *shutdown_rx.borrow() {
            debug!(%name, "read_loop: shutdown observed");
            break;
        }
    }
}
