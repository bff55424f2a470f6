use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use backhaul_control::{ServiceError, TransferError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(err: ServiceError) -> ApiError {
    let status = match &err {
        ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotConnected(_) => StatusCode::NOT_FOUND,
        ServiceError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Registry(_) | ServiceError::Transfer(TransferError::Persistence(_)) => {
            error!("Persistence failure: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ServiceError::Transfer(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(err.to_string())))
}

/// List connected agents
#[utoipa::path(
    get,
    path = "/api/clients",
    responses(
        (status = 200, description = "Connected agents", body = ClientList),
        (status = 500, description = "Session store unavailable", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClientList>, ApiError> {
    debug!("Listing clients");

    let clients = state
        .service
        .list_sessions()
        .await
        .map_err(error_response)?
        .into_iter()
        .map(ClientInfo::from)
        .collect();

    Ok(Json(ClientList {
        success: true,
        clients,
    }))
}

/// Ask an agent to send a file
#[utoipa::path(
    post,
    path = "/api/download",
    request_body = CreateDownloadRequest,
    responses(
        (status = 200, description = "Download requested", body = CreateDownloadResponse),
        (status = 400, description = "Missing clientId or filePath", body = ErrorResponse),
        (status = 404, description = "Agent not connected", body = ErrorResponse),
        (status = 502, description = "Tunnel closed before the request was sent", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "downloads"
)]
pub async fn create_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDownloadRequest>,
) -> Result<Json<CreateDownloadResponse>, ApiError> {
    let download_id = state
        .service
        .request_transfer(&req.client_id, &req.file_path)
        .await
        .map_err(|e| {
            warn!(client_id = %req.client_id, "Download request rejected: {}", e);
            error_response(e)
        })?;

    info!(
        client_id = %req.client_id,
        download_id = %download_id,
        "Download request accepted"
    );

    Ok(Json(CreateDownloadResponse {
        success: true,
        download_id,
        message: format!("Download request sent to client {}", req.client_id),
    }))
}

/// List all transfers
#[utoipa::path(
    get,
    path = "/api/downloads",
    responses(
        (status = 200, description = "All transfers", body = DownloadList)
    ),
    tag = "downloads"
)]
pub async fn list_downloads(State(state): State<Arc<AppState>>) -> Json<DownloadList> {
    let downloads = state
        .service
        .list_transfers()
        .await
        .into_iter()
        .map(Download::from)
        .collect();

    Json(DownloadList {
        success: true,
        downloads,
    })
}

/// Get one transfer
#[utoipa::path(
    get,
    path = "/api/downloads/{id}",
    params(
        ("id" = String, Path, description = "Download ID")
    ),
    responses(
        (status = 200, description = "Transfer state", body = DownloadResponse),
        (status = 404, description = "Unknown download", body = ErrorResponse)
    ),
    tag = "downloads"
)]
pub async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadResponse>, ApiError> {
    debug!("Getting download: {}", id);

    match state.service.get_transfer(&id).await {
        Some(record) => Ok(Json(DownloadResponse {
            success: true,
            download: record.into(),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("Download not found: {}", id))),
        )),
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
