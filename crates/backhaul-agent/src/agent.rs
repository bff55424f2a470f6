use std::sync::Arc;
use std::time::Duration;

use backhaul_proto::{TunnelCodec, TunnelMessage};
use backhaul_transport_websocket::{ClientTlsConfig, TransportError};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::Connector;

use crate::allowlist::PathAllowlist;
use crate::emitter::{EmitError, EmitterConfig, FileEmitter};
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

/// Time allowed for the coordinator to acknowledge `register`
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Giving up after {attempts} failed reconnection attempts")]
    ReconnectExhausted { attempts: usize },
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity to register under
    pub client_id: String,

    /// Coordinator tunnel endpoint (`ws://` or `wss://`)
    pub server_url: String,

    /// TLS trust and client certificate settings
    pub tls: ClientTlsConfig,

    pub emitter: EmitterConfig,

    /// Only files under these directories may be sent (empty = any)
    pub allowed_roots: Vec<std::path::PathBuf>,

    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: format!("agent-{}", uuid::Uuid::new_v4()),
            server_url: "ws://localhost:8080".to_string(),
            tls: ClientTlsConfig::default(),
            emitter: EmitterConfig::default(),
            allowed_roots: Vec::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// The on-premise agent: holds one tunnel and answers download requests on it
pub struct Agent {
    config: AgentConfig,
    emitter: Arc<FileEmitter>,
    connector: Option<Connector>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.client_id.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "Client id cannot be empty".to_string(),
            ));
        }

        let secure = if config.server_url.starts_with("wss://") {
            true
        } else if config.server_url.starts_with("ws://") {
            false
        } else {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid server URL '{}'. Expected ws://host:port or wss://host:port",
                config.server_url
            )));
        };

        let connector = if secure {
            Some(Connector::Rustls(config.tls.build_client_config()?))
        } else {
            None
        };

        let allowlist =
            PathAllowlist::new(config.allowed_roots.clone()).map_err(AgentError::InvalidConfig)?;
        if allowlist.is_empty() {
            tracing::warn!("No allowed roots configured, any readable file may be requested");
        }
        let emitter = FileEmitter::new(config.emitter.clone(), allowlist)
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        let emitter = Arc::new(emitter);

        Ok(Self {
            config,
            emitter,
            connector,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Run until reconnection is exhausted
    ///
    /// Each failed connect or registration counts as one attempt; a
    /// successful registration resets the backoff.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            match self.run_session(&mut reconnect).await {
                Ok(()) => {
                    tracing::warn!(client_id = %self.config.client_id, "Tunnel lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %self.config.client_id,
                        attempt = reconnect.attempt() + 1,
                        retry_in = ?reconnect.current_backoff(),
                        "Connection attempt failed: {}", e
                    );
                }
            }

            if let Err(ReconnectError::MaxAttemptsReached(attempts)) = reconnect.wait().await {
                tracing::error!(client_id = %self.config.client_id, "Reconnection attempts exhausted");
                return Err(AgentError::ReconnectExhausted { attempts });
            }
        }
    }

    /// One connection: connect, register, then serve until the tunnel drops
    ///
    /// `Ok(())` means the tunnel was lost after a successful registration.
    async fn run_session(&self, reconnect: &mut ReconnectManager) -> Result<(), AgentError> {
        tracing::info!(
            client_id = %self.config.client_id,
            server_url = %self.config.server_url,
            "Connecting to coordinator"
        );

        let (websocket, _) = tokio_tungstenite::connect_async_tls_with_config(
            self.config.server_url.as_str(),
            None,
            false,
            self.connector.clone(),
        )
        .await
        .map_err(|e| AgentError::Connection(e.to_string()))?;

        let (mut sink, mut stream) = websocket.split();
        let (tx, mut rx) = mpsc::channel::<TunnelMessage>(64);

        // Writer task: encodes and sends everything queued on `tx`
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(frame) = encode_frame(&message) else {
                    continue;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::debug!("Tunnel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut transfers = JoinSet::new();
        let result = self
            .serve(&mut stream, &tx, &mut transfers, reconnect)
            .await;

        // Transfers cannot outlive their tunnel
        transfers.shutdown().await;
        drop(tx);
        let _ = writer.await;

        result
    }

    async fn serve<S>(
        &self,
        stream: &mut S,
        tx: &mpsc::Sender<TunnelMessage>,
        transfers: &mut JoinSet<()>,
        reconnect: &mut ReconnectManager,
    ) -> Result<(), AgentError>
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        tx.send(TunnelMessage::Register {
            client_id: self.config.client_id.clone(),
        })
        .await
        .map_err(|_| AgentError::Connection("Tunnel closed".to_string()))?;

        tokio::time::timeout(REGISTRATION_TIMEOUT, await_registration(stream))
            .await
            .map_err(|_| {
                AgentError::RegistrationFailed("Timed out waiting for acknowledgement".to_string())
            })??;
        reconnect.reset();

        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Tunnel read error: {}", e);
                    break;
                }
            };

            match TunnelCodec::decode(&text) {
                Ok(TunnelMessage::DownloadRequest {
                    download_id,
                    file_path,
                }) => {
                    tracing::info!(
                        download_id = %download_id,
                        file_path = %file_path,
                        "Download requested"
                    );
                    let emitter = self.emitter.clone();
                    let tx = tx.clone();
                    transfers.spawn(async move {
                        if let Err(EmitError::TunnelClosed) =
                            emitter.handle_request(&download_id, &file_path, &tx).await
                        {
                            tracing::debug!(download_id = %download_id, "Tunnel closed mid-transfer");
                        }
                    });
                }
                Ok(TunnelMessage::Error {
                    download_id,
                    message,
                }) => {
                    tracing::warn!(download_id = %download_id, "Coordinator error: {}", message);
                }
                Ok(other) => {
                    tracing::debug!("Ignoring {} message", other.kind());
                }
                Err(e) => {
                    tracing::warn!("Discarding malformed frame: {}", e);
                }
            }

            // Reap finished transfers
            while transfers.try_join_next().is_some() {}
        }

        Ok(())
    }
}

/// Encode a queued message for the wire
///
/// A message that cannot be encoded is replaced by an `error` for its
/// transfer so the coordinator does not wait on it forever.
fn encode_frame(message: &TunnelMessage) -> Option<String> {
    let e = match TunnelCodec::encode(message) {
        Ok(frame) => return Some(frame),
        Err(e) => e,
    };
    tracing::error!("Failed to encode {}: {}", message.kind(), e);

    let download_id = message.download_id()?;
    TunnelCodec::encode(&TunnelMessage::Error {
        download_id: download_id.to_string(),
        message: format!("Agent failed to encode {}: {}", message.kind(), e),
    })
    .ok()
}

/// Wait for `registered`; an `error` or a closed tunnel means rejection
async fn await_registration<S>(stream: &mut S) -> Result<(), AgentError>
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(AgentError::Connection(e.to_string())),
        };

        match TunnelCodec::decode(&text) {
            Ok(TunnelMessage::Registered {
                client_id,
                message,
                secure,
                mutual_auth,
            }) => {
                tracing::info!(
                    client_id = %client_id,
                    secure = secure.unwrap_or(false),
                    mutual_auth = mutual_auth.unwrap_or(false),
                    "Registered: {}", message
                );
                return Ok(());
            }
            Ok(TunnelMessage::Error { message, .. }) => {
                return Err(AgentError::RegistrationFailed(message));
            }
            Ok(other) => {
                tracing::debug!("Ignoring {} message before registration", other.kind());
            }
            Err(e) => {
                tracing::warn!("Discarding malformed frame: {}", e);
            }
        }
    }

    Err(AgentError::RegistrationFailed(
        "Tunnel closed before registration".to_string(),
    ))
}
