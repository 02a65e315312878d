//! Per-client sessions and the accept loop.
//!
//! A session reads the startup handshake, refuses TLS, picks a route by
//! database name, opens a tunnel and then relays bytes until either side is
//! done. Failures before the relay are reported to the client as an
//! ErrorResponse.

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Registry;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{
    read_initial_packet, write_generic_packet, write_initial_packet, ErrorResponse,
    InitialPacket, ProtocolVersion, StartupMessage, SSL_REFUSED,
};
use crate::tunnel::{Tunnel, TunnelDialer, Upstream};

/// State shared by every session.
pub struct ServerState {
    pub registry: Registry,
    pub dialer: TunnelDialer,
}

/// Which side ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client finished first, after this many bytes went upstream.
    Client(u64),
    /// The backend finished first, after this many bytes went to the client.
    Upstream(u64),
}

/// Run one client session to completion.
///
/// The client stream is shut down before returning.
pub async fn handle_client<S>(client: &mut S, server: &ServerState, peer_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match handshake(client, server).await {
        Ok(None) => debug!("{} closed the connection before a startup message", peer_addr),
        Ok(Some(mut tunnel)) => {
            match relay(client, &mut tunnel).await {
                Ok(RelayEnd::Client(n)) => {
                    info!("{} disconnected ({} bytes sent upstream)", peer_addr, n)
                }
                Ok(RelayEnd::Upstream(n)) => {
                    info!("Backend closed for {} ({} bytes sent to client)", peer_addr, n)
                }
                Err(e) => warn!("Relay for {} ended: {}", peer_addr, e),
            }
            if let Err(e) = tunnel.close().await {
                warn!("Closing tunnel for {}: {}", peer_addr, e);
            }
        }
        Err(e) => {
            warn!("Session error from {}: {}", peer_addr, e);
            if e.is_reportable() {
                report_error(client, &e).await;
            }
        }
    }

    if let Err(e) = client.shutdown().await {
        debug!("Shutting down {}: {}", peer_addr, e);
    }
}

/// Drive the startup phase up to an open tunnel that has received the
/// client's (rewritten) startup message.
///
/// Returns `Ok(None)` if the client went away before sending a startup message.
async fn handshake<S>(client: &mut S, server: &ServerState) -> ProxyResult<Option<Tunnel>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(mut startup) = await_startup(client).await? else {
        return Ok(None);
    };

    let database = startup.database().map(Cow::into_owned);
    let route = database
        .as_deref()
        .and_then(|name| server.registry.get(name))
        .ok_or_else(|| ProxyError::NoSuchConnection(database.clone()))?;
    let database = database.unwrap_or_default();

    info!(
        "Routing {}@{} to {} via {}",
        startup.user().as_deref().unwrap_or("<unknown>"),
        database,
        route.addr,
        route.ssh.addr
    );

    let tunnel = server
        .dialer
        .dial(&route.ssh, &route.addr)
        .await
        .map_err(|e| ProxyError::TunnelEstablishmentFailed {
            database: database.clone(),
            source: Box::new(e),
        })?;

    startup.set_database(route.dbname.as_str());
    forward_startup(tunnel, &startup).await.map(Some)
}

/// Send the rewritten startup message upstream.
///
/// On failure the upstream is closed before the error is returned.
async fn forward_startup<U: Upstream>(mut upstream: U, startup: &StartupMessage) -> ProxyResult<U> {
    if let Err(e) = write_initial_packet(&mut upstream, &startup.encode()).await {
        if let Err(close_err) = upstream.close().await {
            warn!("Closing upstream after failed startup: {}", close_err);
        }
        return Err(e);
    }
    Ok(upstream)
}

/// Read initial packets, refusing each SSLRequest, until a startup message arrives.
async fn await_startup<S>(client: &mut S) -> ProxyResult<Option<StartupMessage>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(packet) = read_initial_packet(client).await? else {
            return Ok(None);
        };

        match packet.decode()? {
            InitialPacket::SslRequest => {
                debug!("Refusing SSL request");
                client.write_all(&[SSL_REFUSED]).await?;
                client.flush().await?;
            }
            InitialPacket::Startup(startup) => {
                let version = startup.version();
                if version != ProtocolVersion::V3_0 {
                    return Err(ProxyError::UnsupportedProtocolVersion {
                        major: version.major,
                        minor: version.minor,
                    });
                }
                return Ok(Some(startup));
            }
        }
    }
}

/// Copy bytes both ways until one direction finishes.
///
/// The other direction is abandoned; closing either stream is left to the caller.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U) -> ProxyResult<RelayEnd>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut upstream_write) => Ok(RelayEnd::Client(res?)),
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => Ok(RelayEnd::Upstream(res?)),
    }
}

/// Best-effort ErrorResponse to a client whose session failed.
async fn report_error<S>(client: &mut S, err: &ProxyError)
where
    S: AsyncWrite + Unpin,
{
    let packet = ErrorResponse::from_error(err).encode();
    if let Err(e) = write_generic_packet(client, &packet).await {
        warn!("Failed to send error response: {}", e);
    }
}

/// Accept connections until `shutdown` resolves, one task per client.
pub async fn run_server<F>(listener: TcpListener, server: Arc<ServerState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!("Proxy listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        let (mut stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down listener");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let server = server.clone();
        tokio::spawn(async move {
            debug!("Connection from {}", peer_addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
            }
            handle_client(&mut stream, &server, peer_addr).await;
        });
    }
}
