//! Tunnel connection handler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backhaul_proto::{TunnelCodec, TunnelMessage};
use backhaul_transport_websocket::PeerIdentity;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::connection::TunnelHandle;
use crate::session_registry::{RegistryError, SessionRegistry};
use crate::transfer::{TransferCoordinator, TransferError};

/// Time allowed for the close frame to flush before the writer is dropped
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Claimed identity '{claimed}' does not match certificate identity '{verified}'")]
    IdentityMismatch { claimed: String, verified: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Registered { client_id: String },
    Closed,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How often a registered session's liveness marker is refreshed
    pub heartbeat_interval: Duration,

    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            outbound_buffer: 64,
        }
    }
}

/// What the read loop should do after a frame
enum Flow {
    Continue,
    Close(Option<HandlerError>),
}

/// Handles tunnels opened by agents
pub struct TunnelHandler {
    registry: Arc<SessionRegistry>,
    transfers: Arc<TransferCoordinator>,
    config: HandlerConfig,
}

impl TunnelHandler {
    pub fn new(registry: Arc<SessionRegistry>, transfers: Arc<TransferCoordinator>) -> Self {
        Self {
            registry,
            transfers,
            config: HandlerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Drive one tunnel until it closes
    ///
    /// Returns an error when the connection was closed because of a failed
    /// registration; a peer hanging up is a normal `Ok(())`.
    pub async fn handle_connection<S>(
        &self,
        websocket: WebSocketStream<S>,
        peer: PeerIdentity,
        remote_addr: SocketAddr,
    ) -> Result<(), HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = uuid::Uuid::new_v4().to_string();
        debug!(
            connection_id = %connection_id,
            secure = peer.secure,
            mutual_auth = peer.mutual_auth,
            "Handling tunnel from {}", remote_addr
        );

        let (mut sink, mut stream) = websocket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.outbound_buffer.max(1));

        // Writer task: the only owner of the sink
        let writer_connection = connection_id.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(connection_id = %writer_connection, "Tunnel write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let handle = TunnelHandle::new(connection_id.clone(), tx);
        let mut state = ConnectionState::Connected;
        let mut outcome = Ok(());

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!(connection_id = %connection_id, "Tunnel read error from {}: {}", remote_addr, e);
                            break;
                        }
                        None => {
                            debug!(connection_id = %connection_id, "Tunnel stream ended");
                            break;
                        }
                    };

                    let flow = match message {
                        Message::Text(text) => {
                            self.on_text(&text, &mut state, &peer, &handle).await
                        }
                        Message::Binary(data) => {
                            warn!(
                                connection_id = %connection_id,
                                len = data.len(),
                                "Discarding binary frame"
                            );
                            Flow::Continue
                        }
                        Message::Ping(payload) => {
                            if handle_pong(&handle, payload).await {
                                Flow::Continue
                            } else {
                                Flow::Close(None)
                            }
                        }
                        Message::Close(frame) => {
                            debug!(connection_id = %connection_id, "Peer closed tunnel: {:?}", frame);
                            Flow::Close(None)
                        }
                        Message::Pong(_) | Message::Frame(_) => Flow::Continue,
                    };

                    if let Flow::Close(error) = flow {
                        if let Some(e) = error {
                            outcome = Err(e);
                        }
                        break;
                    }
                }

                _ = heartbeat.tick(), if matches!(state, ConnectionState::Registered { .. }) => {
                    if let ConnectionState::Registered { ref client_id } = state {
                        match self.registry.refresh(client_id).await {
                            Ok(true) => debug!(client_id = %client_id, "Refreshed liveness marker"),
                            Ok(false) => debug!(client_id = %client_id, "Session no longer registered"),
                            Err(e) => warn!(client_id = %client_id, "Failed to refresh liveness marker: {}", e),
                        }
                    }
                }
            }
        }

        if let ConnectionState::Registered { ref client_id } = state {
            match self
                .registry
                .unregister_if_current(client_id, &connection_id)
                .await
            {
                Ok(_) => info!(client_id = %client_id, "Agent disconnected"),
                Err(e) => error!(
                    client_id = %client_id,
                    "Failed to unregister agent on disconnect: {}", e
                ),
            }
        }
        state = ConnectionState::Closed;
        debug!(connection_id = %connection_id, state = ?state, "Tunnel handler finished");

        let _ = handle.close().await;
        drop(handle);
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }

        outcome
    }

    async fn on_text(
        &self,
        text: &str,
        state: &mut ConnectionState,
        peer: &PeerIdentity,
        handle: &TunnelHandle,
    ) -> Flow {
        let message = match TunnelCodec::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %handle.connection_id(), "Discarding malformed frame: {}", e);
                return Flow::Continue;
            }
        };

        match message {
            TunnelMessage::Register { client_id } => {
                self.on_register(client_id, state, peer, handle).await
            }
            message => {
                let ConnectionState::Registered { ref client_id } = *state else {
                    warn!(
                        connection_id = %handle.connection_id(),
                        kind = message.kind(),
                        "Dropping message received before registration"
                    );
                    return Flow::Continue;
                };
                self.dispatch(client_id, message).await;
                Flow::Continue
            }
        }
    }

    async fn on_register(
        &self,
        client_id: String,
        state: &mut ConnectionState,
        peer: &PeerIdentity,
        handle: &TunnelHandle,
    ) -> Flow {
        if let ConnectionState::Registered { client_id: ref current } = *state {
            warn!(
                client_id = %current,
                claimed = %client_id,
                "Ignoring repeated registration on registered tunnel"
            );
            return Flow::Continue;
        }

        if client_id.trim().is_empty() {
            warn!(connection_id = %handle.connection_id(), "Rejecting registration with empty client id");
            reject(handle, "Registration requires a client id").await;
            return Flow::Close(Some(HandlerError::ConnectionError(
                "Empty client id".to_string(),
            )));
        }

        if !peer.permits(&client_id) {
            let verified = peer.verified_id.clone().unwrap_or_default();
            warn!(
                claimed = %client_id,
                verified = %verified,
                "Rejecting registration: identity does not match client certificate"
            );
            reject(handle, "Client id does not match certificate identity").await;
            return Flow::Close(Some(HandlerError::IdentityMismatch {
                claimed: client_id,
                verified,
            }));
        }

        if let Err(e) = self.registry.register(&client_id, handle.clone()).await {
            error!(client_id = %client_id, "Failed to register agent: {}", e);
            reject(handle, "Registration failed").await;
            return Flow::Close(Some(e.into()));
        }

        info!(
            client_id = %client_id,
            secure = peer.secure,
            mutual_auth = peer.mutual_auth,
            "Agent registered"
        );

        let ack = TunnelMessage::Registered {
            client_id: client_id.clone(),
            message: "Registration successful".to_string(),
            secure: Some(peer.secure),
            mutual_auth: Some(peer.mutual_auth),
        };
        *state = ConnectionState::Registered { client_id };

        if let Err(e) = handle.send(&ack).await {
            warn!("Failed to acknowledge registration: {}", e);
            return Flow::Close(None);
        }
        Flow::Continue
    }

    async fn dispatch(&self, client_id: &str, message: TunnelMessage) {
        // Agents may only touch transfers requested from them
        if let Some(download_id) = message.download_id() {
            match self.transfers.owner(download_id).await {
                Some(owner) if owner == client_id => {}
                Some(owner) => {
                    warn!(
                        client_id = %client_id,
                        download_id = %download_id,
                        owner = %owner,
                        kind = message.kind(),
                        "Ignoring message for a transfer owned by another client"
                    );
                    return;
                }
                None => {
                    debug!(
                        client_id = %client_id,
                        download_id = %download_id,
                        "Message for unknown transfer"
                    );
                    return;
                }
            }
        }

        let result = match message {
            TunnelMessage::FileMetadata {
                download_id,
                file_name,
                file_size,
                total_chunks,
            } => {
                self.transfers
                    .on_metadata(&download_id, &file_name, file_size, total_chunks)
                    .await
            }
            TunnelMessage::FileChunk {
                download_id,
                chunk_index,
                data,
                is_last,
            } => {
                self.transfers
                    .on_chunk(&download_id, chunk_index, &data, is_last)
                    .await
            }
            TunnelMessage::Error {
                download_id,
                message,
            } => {
                warn!(
                    client_id = %client_id,
                    download_id = %download_id,
                    "Agent reported error: {}", message
                );
                self.transfers.fail(&download_id, &message).await
            }
            other => {
                warn!(
                    client_id = %client_id,
                    kind = other.kind(),
                    "Ignoring unexpected message from agent"
                );
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(TransferError::UnknownTransfer(id)) => {
                debug!(client_id = %client_id, download_id = %id, "Message for unknown transfer");
            }
            Err(e) => {
                warn!(client_id = %client_id, "Transfer update failed: {}", e);
            }
        }
    }
}

async fn handle_pong(handle: &TunnelHandle, payload: Vec<u8>) -> bool {
    handle.send_raw(Message::Pong(payload)).await.is_ok()
}

async fn reject(handle: &TunnelHandle, reason: &str) {
    let _ = handle
        .send(&TunnelMessage::Error {
            download_id: String::new(),
            message: reason.to_string(),
        })
        .await;
    let _ = handle.close().await;
}
