//! Protocol message types

use serde::{Deserialize, Serialize};

/// Main tunnel protocol message enum
///
/// Every WebSocket text frame carries exactly one of these, serialized as a
/// JSON object whose `type` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Agent announces the identity it wants to be reachable under
    #[serde(rename_all = "camelCase")]
    Register { client_id: String },

    /// Coordinator confirms the registration
    #[serde(rename_all = "camelCase")]
    Registered {
        client_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secure: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mutual_auth: Option<bool>,
    },

    /// Coordinator asks the agent to stream a file back
    #[serde(rename_all = "camelCase")]
    DownloadRequest {
        download_id: String,
        file_path: String,
    },

    /// Agent describes the file it is about to stream
    #[serde(rename_all = "camelCase")]
    FileMetadata {
        download_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },

    /// One base64-encoded slice of the file
    #[serde(rename_all = "camelCase")]
    FileChunk {
        download_id: String,
        chunk_index: u32,
        data: String,
        is_last: bool,
    },

    /// Failure report, sent by either side
    #[serde(rename_all = "camelCase")]
    Error {
        download_id: String,
        message: String,
    },
}

impl TunnelMessage {
    /// Wire name of the message, as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Register { .. } => "register",
            TunnelMessage::Registered { .. } => "registered",
            TunnelMessage::DownloadRequest { .. } => "download_request",
            TunnelMessage::FileMetadata { .. } => "file_metadata",
            TunnelMessage::FileChunk { .. } => "file_chunk",
            TunnelMessage::Error { .. } => "error",
        }
    }

    /// Transfer this message belongs to, if any
    pub fn download_id(&self) -> Option<&str> {
        match self {
            TunnelMessage::DownloadRequest { download_id, .. }
            | TunnelMessage::FileMetadata { download_id, .. }
            | TunnelMessage::FileChunk { download_id, .. }
            | TunnelMessage::Error { download_id, .. } => Some(download_id),
            TunnelMessage::Register { .. } | TunnelMessage::Registered { .. } => None,
        }
    }
}
