//! Codec for encoding/decoding tunnel messages

use crate::messages::TunnelMessage;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Tunnel message codec
///
/// One JSON document per WebSocket text frame; the frame boundary is the
/// message boundary so no length prefix is needed.
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a tunnel message to a JSON text frame
    pub fn encode(msg: &TunnelMessage) -> Result<String, CodecError> {
        let payload = serde_json::to_string(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        Ok(payload)
    }

    /// Decode a tunnel message from a JSON text frame
    pub fn decode(frame: &str) -> Result<TunnelMessage, CodecError> {
        if frame.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(frame.len()));
        }

        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = TunnelMessage::DownloadRequest {
            download_id: "abc".to_string(),
            file_path: "/var/log/app.log".to_string(),
        };

        let frame = TunnelCodec::encode(&msg).unwrap();
        assert!(frame.contains("\"type\":\"download_request\""));

        let decoded = TunnelCodec::decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_decode_garbage() {
        let result = TunnelCodec::decode("not json at all");
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }

    #[test]
    fn test_decode_missing_field() {
        let result = TunnelCodec::decode(r#"{"type":"file_chunk","downloadId":"t1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_too_large() {
        let msg = TunnelMessage::Error {
            download_id: "t1".to_string(),
            message: "x".repeat(TunnelCodec::MAX_MESSAGE_SIZE + 1),
        };
        assert!(matches!(
            TunnelCodec::encode(&msg),
            Err(CodecError::MessageTooLarge(_))
        ));
    }
}
