use backhaul_control::{SessionInfo, TransferRecord, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A connected agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Agent identity
    pub client_id: String,
    /// When the current tunnel registered
    pub connected_at: DateTime<Utc>,
}

impl From<SessionInfo> for ClientInfo {
    fn from(session: SessionInfo) -> Self {
        Self {
            client_id: session.client_id,
            connected_at: session.connected_at,
        }
    }
}

/// Connected agents
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientList {
    pub success: bool,
    pub clients: Vec<ClientInfo>,
}

/// Request a file from an agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadRequest {
    /// Agent to fetch from
    #[serde(default)]
    pub client_id: String,
    /// Path of the file on the agent's host
    #[serde(default)]
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadResponse {
    pub success: bool,
    pub download_id: String,
    pub message: String,
}

/// Transfer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Initiated,
    Downloading,
    Completed,
    Failed,
}

impl From<TransferStatus> for DownloadStatus {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Initiated => DownloadStatus::Initiated,
            TransferStatus::Downloading => DownloadStatus::Downloading,
            TransferStatus::Completed => DownloadStatus::Completed,
            TransferStatus::Failed => DownloadStatus::Failed,
        }
    }
}

/// A file transfer
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub download_id: String,
    pub client_id: String,
    pub status: DownloadStatus,
    pub file_path: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Size in bytes, known once the agent sent metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    pub received_chunks: u32,
    /// Percentage of chunks received (0-100)
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the assembled file was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl From<TransferRecord> for Download {
    fn from(record: TransferRecord) -> Self {
        Self {
            download_id: record.transfer_id,
            client_id: record.client_id,
            status: record.status.into(),
            file_path: record.file_path,
            requested_at: record.requested_at,
            file_name: record.file_name,
            file_size: record.file_size,
            total_chunks: record.total_chunks,
            received_chunks: record.received_chunks,
            progress: record.progress,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
            error: record.error,
            output_path: record.output_path.map(|p| p.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DownloadList {
    pub success: bool,
    pub downloads: Vec<Download>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DownloadResponse {
    pub success: bool,
    pub download: Download,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    /// Error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
