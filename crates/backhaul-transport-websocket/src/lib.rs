//! WebSocket tunnel transport using tokio-tungstenite
//!
//! Agents dial out to the coordinator over `ws://` or `wss://`. When the
//! coordinator is configured with a client CA, the TLS handshake requires a
//! client certificate and the verified subject Common Name becomes the
//! connection's [`PeerIdentity`].
//!
//! # Features
//!
//! - **Encryption**: TLS via rustls (wss://), optional for development
//! - **Mutual TLS**: client certificates verified against a configured CA
//! - **Firewall Friendly**: a single outbound TCP connection from the agent

pub mod config;
pub mod identity;
pub mod listener;
pub mod stream;

pub use config::{ensure_crypto_provider, ClientTlsConfig, ServerTlsConfig};
pub use identity::{identity_from_certificate, PeerIdentity};
pub use listener::{EstablishedTunnel, IncomingTunnel, TunnelListener};
pub use stream::TunnelIo;

use thiserror::Error;

/// Server-side WebSocket over a plain or TLS socket
pub type TunnelWebSocket = tokio_tungstenite::WebSocketStream<TunnelIo>;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Bind error on {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
