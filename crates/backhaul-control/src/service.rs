//! Operations behind the HTTP surface

use std::sync::Arc;

use backhaul_proto::TunnelMessage;
use thiserror::Error;
use tracing::{info, warn};

use crate::session_registry::{RegistryError, SessionInfo, SessionRegistry};
use crate::transfer::{TransferCoordinator, TransferError, TransferRecord};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Client not connected: {0}")]
    NotConnected(String),

    #[error("Failed to dispatch download request: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Entry point for listing sessions and starting transfers
#[derive(Debug, Clone)]
pub struct TransferService {
    registry: Arc<SessionRegistry>,
    transfers: Arc<TransferCoordinator>,
}

impl TransferService {
    pub fn new(registry: Arc<SessionRegistry>, transfers: Arc<TransferCoordinator>) -> Self {
        Self {
            registry,
            transfers,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transfers(&self) -> &Arc<TransferCoordinator> {
        &self.transfers
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ServiceError> {
        Ok(self.registry.list().await?)
    }

    /// Ask `client_id` to send `file_path`
    ///
    /// No transfer record is created unless the agent is reachable. If the
    /// request cannot be queued on the tunnel the new transfer is failed.
    pub async fn request_transfer(
        &self,
        client_id: &str,
        file_path: &str,
    ) -> Result<String, ServiceError> {
        if client_id.trim().is_empty() || file_path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "clientId and filePath are required".to_string(),
            ));
        }

        if !self.registry.is_connected(client_id).await? {
            return Err(ServiceError::NotConnected(client_id.to_string()));
        }
        let handle = self
            .registry
            .get(client_id)
            .await
            .ok_or_else(|| ServiceError::NotConnected(client_id.to_string()))?;
        // Handler task already gone, unregistration pending
        if handle.is_closed() {
            return Err(ServiceError::NotConnected(client_id.to_string()));
        }

        let download_id = self.transfers.initiate(client_id, file_path).await?;

        let request = TunnelMessage::DownloadRequest {
            download_id: download_id.clone(),
            file_path: file_path.to_string(),
        };
        if let Err(e) = handle.send(&request).await {
            warn!(
                client_id = %client_id,
                download_id = %download_id,
                "Failed to send download request: {}", e
            );
            self.transfers
                .fail(&download_id, &format!("Failed to send download request: {}", e))
                .await?;
            return Err(ServiceError::Dispatch(e.to_string()));
        }

        info!(
            client_id = %client_id,
            download_id = %download_id,
            file_path = %file_path,
            "Download requested"
        );
        Ok(download_id)
    }

    pub async fn list_transfers(&self) -> Vec<TransferRecord> {
        self.transfers.list_all().await
    }

    pub async fn get_transfer(&self, download_id: &str) -> Option<TransferRecord> {
        self.transfers.get_status(download_id).await
    }
}
