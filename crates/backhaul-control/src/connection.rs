//! Tunnel connection handles

use backhaul_proto::{CodecError, TunnelCodec, TunnelMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Tunnel closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] CodecError),
}

/// Sending half of a live tunnel
///
/// The socket itself is owned by the handler task that accepted it; the
/// registry only ever holds one of these, which feeds that task's writer.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    connection_id: String,
    tx: mpsc::Sender<Message>,
}

impl TunnelHandle {
    pub fn new(connection_id: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            connection_id: connection_id.into(),
            tx,
        }
    }

    /// Identifier of the connection this handle writes to
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a protocol message on the tunnel
    pub async fn send(&self, message: &TunnelMessage) -> Result<(), HandleError> {
        let frame = TunnelCodec::encode(message)?;
        self.tx
            .send(Message::Text(frame))
            .await
            .map_err(|_| HandleError::Closed)
    }

    /// Queue a control frame as-is
    pub async fn send_raw(&self, frame: Message) -> Result<(), HandleError> {
        self.tx.send(frame).await.map_err(|_| HandleError::Closed)
    }

    /// Ask the writer to close the WebSocket
    pub async fn close(&self) -> Result<(), HandleError> {
        self.tx
            .send(Message::Close(None))
            .await
            .map_err(|_| HandleError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
