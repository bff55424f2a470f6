//! Tunnel listener

use crate::config::ServerTlsConfig;
use crate::identity::{identity_from_certificate, PeerIdentity};
use crate::stream::TunnelIo;
use crate::{TransportError, TransportResult, TunnelWebSocket};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Default budget for the TLS + WebSocket handshakes of one connection
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts agent tunnels on a TCP port
pub struct TunnelListener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    mutual_auth: bool,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TunnelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .field("mutual_auth", &self.mutual_auth)
            .finish()
    }
}

impl TunnelListener {
    /// Bind the listener; `tls` of `None` serves plain `ws://`
    pub async fn bind(
        bind_addr: SocketAddr,
        tls: Option<&ServerTlsConfig>,
    ) -> TransportResult<Self> {
        let tls_acceptor = tls.map(ServerTlsConfig::build_tls_acceptor).transpose()?;
        let mutual_auth = tls.is_some_and(ServerTlsConfig::mutual_auth);

        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr()?;
        let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
        info!(
            mutual_auth,
            "Tunnel listener bound to {}://{}", scheme, local_addr
        );

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            mutual_auth,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Wait for the next TCP connection
    ///
    /// Handshakes are left to [`IncomingTunnel::establish`] so a slow peer
    /// does not hold up the accept loop.
    pub async fn accept(&self) -> TransportResult<IncomingTunnel> {
        let (tcp_stream, remote_addr) = self.tcp_listener.accept().await?;
        debug!("Incoming TCP connection from {}", remote_addr);

        Ok(IncomingTunnel {
            tcp_stream,
            remote_addr,
            tls_acceptor: self.tls_acceptor.clone(),
            mutual_auth: self.mutual_auth,
            handshake_timeout: self.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }

    pub fn mutual_auth(&self) -> bool {
        self.mutual_auth
    }
}

/// A TCP connection that has not been through TLS/WebSocket handshakes yet
pub struct IncomingTunnel {
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    mutual_auth: bool,
    handshake_timeout: Duration,
}

/// A tunnel ready for application messages
pub struct EstablishedTunnel {
    pub websocket: TunnelWebSocket,
    pub peer: PeerIdentity,
    pub remote_addr: SocketAddr,
}

impl IncomingTunnel {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Run the TLS and WebSocket handshakes
    ///
    /// Under mutual TLS a connection without a verified certificate carrying
    /// a usable subject CN is refused here, before any message is read.
    pub async fn establish(self) -> TransportResult<EstablishedTunnel> {
        let remote_addr = self.remote_addr;
        let timeout = self.handshake_timeout;

        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Handshake with {} timed out after {:?}", remote_addr, timeout);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn handshake(self) -> TransportResult<EstablishedTunnel> {
        let remote_addr = self.remote_addr;

        let (io, peer) = match &self.tls_acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(self.tcp_stream).await.map_err(|e| {
                    warn!("TLS handshake failed from {}: {}", remote_addr, e);
                    TransportError::TlsError(format!("TLS handshake failed: {}", e))
                })?;

                let peer = if self.mutual_auth {
                    let (_, session) = tls_stream.get_ref();
                    match identity_from_certificate(session.peer_certificates()) {
                        Ok(verified_id) => {
                            debug!(
                                verified_id = %verified_id,
                                "Client certificate verified for {}", remote_addr
                            );
                            PeerIdentity::mutual(verified_id)
                        }
                        Err(e) => {
                            warn!("Refusing connection from {}: {}", remote_addr, e);
                            return Err(e);
                        }
                    }
                } else {
                    PeerIdentity::tls()
                };

                (TunnelIo::Tls(Box::new(tls_stream)), peer)
            }
            None => (TunnelIo::Plain(self.tcp_stream), PeerIdentity::plaintext()),
        };

        let websocket = tokio_tungstenite::accept_async(io).await.map_err(|e| {
            warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
            TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
        })?;

        info!(
            secure = peer.secure,
            mutual_auth = peer.mutual_auth,
            "WebSocket tunnel established from {}",
            remote_addr
        );

        Ok(EstablishedTunnel {
            websocket,
            peer,
            remote_addr,
        })
    }
}
