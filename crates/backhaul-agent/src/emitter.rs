//! Streams a requested file up the tunnel as chunks
//!
//! Sends one `file_metadata`, then `file_chunk` messages in ascending index
//! order with a fixed pause between them. The agent paces itself; the
//! coordinator never pushes back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backhaul_proto::{chunk_count, encode_chunk, TunnelMessage, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allowlist::PathAllowlist;

/// Default pause between chunks
pub const DEFAULT_CHUNK_PACING: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Access denied: {0} is outside the allowed directories")]
    AccessDenied(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Chunk size must be between 1 and {max} bytes, got {0}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub chunk_size: usize,
    pub pacing: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing: DEFAULT_CHUNK_PACING,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEmitter {
    config: EmitterConfig,
    allowlist: PathAllowlist,
}

impl FileEmitter {
    /// Fails if a chunk would not fit in a single tunnel frame
    pub fn new(config: EmitterConfig, allowlist: PathAllowlist) -> Result<Self, EmitError> {
        if config.chunk_size == 0 || config.chunk_size > MAX_CHUNK_SIZE {
            return Err(EmitError::InvalidChunkSize(config.chunk_size));
        }
        Ok(Self { config, allowlist })
    }

    /// Serve one `download_request`
    ///
    /// File problems are reported to the coordinator as an `error` message
    /// and never escape; only a closed tunnel is returned as an error.
    pub async fn handle_request(
        &self,
        download_id: &str,
        file_path: &str,
        tx: &mpsc::Sender<TunnelMessage>,
    ) -> Result<(), EmitError> {
        match self.emit(download_id, file_path, tx).await {
            Ok(()) => Ok(()),
            Err(EmitError::TunnelClosed) => Err(EmitError::TunnelClosed),
            Err(e) => {
                warn!(download_id = %download_id, "Transfer failed: {}", e);
                tx.send(TunnelMessage::Error {
                    download_id: download_id.to_string(),
                    message: e.to_string(),
                })
                .await
                .map_err(|_| EmitError::TunnelClosed)
            }
        }
    }

    async fn emit(
        &self,
        download_id: &str,
        file_path: &str,
        tx: &mpsc::Sender<TunnelMessage>,
    ) -> Result<(), EmitError> {
        let path = self.resolve(file_path).await?;
        let io_err = |source| EmitError::Io {
            path: file_path.to_string(),
            source,
        };

        let metadata = tokio::fs::metadata(&path).await.map_err(io_err)?;
        if !metadata.is_file() {
            return Err(EmitError::NotAFile(file_path.to_string()));
        }

        let file_size = metadata.len();
        let chunk_size = self.config.chunk_size;
        let total_chunks = chunk_count(file_size, chunk_size);
        let file_name = file_name(&path);

        let mut file = File::open(&path).await.map_err(io_err)?;

        info!(
            download_id = %download_id,
            file = %path.display(),
            file_size,
            total_chunks,
            "Sending file"
        );
        send(
            tx,
            TunnelMessage::FileMetadata {
                download_id: download_id.to_string(),
                file_name,
                file_size,
                total_chunks,
            },
        )
        .await?;

        let mut buffer = vec![0u8; chunk_size];
        for chunk_index in 0..total_chunks {
            let len = read_full(&mut file, &mut buffer).await.map_err(io_err)?;
            let is_last = chunk_index + 1 == total_chunks;

            send(
                tx,
                TunnelMessage::FileChunk {
                    download_id: download_id.to_string(),
                    chunk_index,
                    data: encode_chunk(&buffer[..len]),
                    is_last,
                },
            )
            .await?;
            debug!(download_id = %download_id, chunk_index, len, "Sent chunk");

            if !is_last && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }
        }

        info!(download_id = %download_id, "File sent");
        Ok(())
    }

    async fn resolve(&self, file_path: &str) -> Result<PathBuf, EmitError> {
        let path = tokio::fs::canonicalize(file_path)
            .await
            .map_err(|source| EmitError::Io {
                path: file_path.to_string(),
                source,
            })?;

        if !self.allowlist.is_allowed(&path) {
            return Err(EmitError::AccessDenied(file_path.to_string()));
        }
        Ok(path)
    }
}

async fn send(tx: &mpsc::Sender<TunnelMessage>, message: TunnelMessage) -> Result<(), EmitError> {
    tx.send(message).await.map_err(|_| EmitError::TunnelClosed)
}

/// Fill `buffer` unless EOF comes first; returns the byte count
async fn read_full(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}
