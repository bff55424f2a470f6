//! File transfer lifecycle tracking
//!
//! A transfer is created by [`TransferCoordinator::initiate`], shaped by the
//! agent's `file_metadata`, filled by `file_chunk` messages in any order, and
//! assembled to disk when the chunk flagged as last arrives. Status only
//! moves forward: initiated -> downloading -> completed | failed, or straight
//! from initiated to failed.
//!
//! Every change is mirrored into the remote store under
//! `backhaul:transfer:<id>`. Records are never removed.

use backhaul_proto::decode_chunk;
use backhaul_store::{keys, RemoteStore, StoreError};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Failed to write transfer output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Initiated,
    Downloading,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Initiated => "initiated",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a transfer, without chunk buffers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    #[serde(rename = "downloadId")]
    pub transfer_id: String,
    pub client_id: String,
    pub status: TransferStatus,
    pub file_path: String,
    pub requested_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    pub received_chunks: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl TransferRecord {
    fn new(transfer_id: String, client_id: &str, file_path: &str) -> Self {
        let now = Utc::now();
        Self {
            transfer_id,
            client_id: client_id.to_string(),
            status: TransferStatus::Initiated,
            file_path: file_path.to_string(),
            requested_at: now,
            last_activity_at: now,
            file_name: None,
            file_size: None,
            total_chunks: None,
            received_chunks: 0,
            progress: 0,
            completed_at: None,
            duration_ms: None,
            error: None,
            output_path: None,
        }
    }

    /// Hash fields written to the remote store
    fn persisted_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("clientId".to_string(), self.client_id.clone()),
            ("status".to_string(), self.status.to_string()),
            ("filePath".to_string(), self.file_path.clone()),
            ("requestedAt".to_string(), self.requested_at.to_rfc3339()),
            ("lastActivityAt".to_string(), self.last_activity_at.to_rfc3339()),
            ("receivedChunks".to_string(), self.received_chunks.to_string()),
            ("progress".to_string(), self.progress.to_string()),
        ];

        if let Some(ref name) = self.file_name {
            fields.push(("fileName".to_string(), name.clone()));
        }
        if let Some(size) = self.file_size {
            fields.push(("fileSize".to_string(), size.to_string()));
        }
        if let Some(total) = self.total_chunks {
            fields.push(("totalChunks".to_string(), total.to_string()));
        }
        if let Some(ts) = self.completed_at {
            fields.push(("completedAt".to_string(), ts.to_rfc3339()));
        }
        if let Some(ms) = self.duration_ms {
            fields.push(("durationMs".to_string(), ms.to_string()));
        }
        if let Some(ref reason) = self.error {
            fields.push(("error".to_string(), reason.clone()));
        }
        if let Some(ref path) = self.output_path {
            fields.push(("outputPath".to_string(), path.display().to_string()));
        }

        fields
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Root directory for assembled files
    pub download_dir: PathBuf,

    /// Require every chunk slot to be filled before assembling
    pub strict_completion: bool,

    /// Fail non-terminal transfers idle for longer than this
    pub transfer_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            strict_completion: false,
            transfer_timeout: None,
        }
    }
}

#[derive(Debug)]
struct TransferEntry {
    record: TransferRecord,
    /// Received chunks by index; sized by what arrives, not by the metadata
    slots: BTreeMap<u32, Bytes>,
    started: Instant,
    last_activity: Instant,
    assembling: bool,
}

impl TransferEntry {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.record.last_activity_at = Utc::now();
    }
}

/// Tracks every transfer the coordinator has started
#[derive(Debug)]
pub struct TransferCoordinator {
    transfers: RwLock<HashMap<String, TransferEntry>>,
    store: Arc<dyn RemoteStore>,
    config: TransferConfig,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, config: TransferConfig) -> Self {
        info!(
            download_dir = %config.download_dir.display(),
            strict_completion = config.strict_completion,
            "Creating transfer coordinator"
        );
        Self {
            transfers: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Create a transfer for `client_id` and return its id
    ///
    /// The record only becomes visible once its initial fields are persisted.
    pub async fn initiate(&self, client_id: &str, file_path: &str) -> Result<String, TransferError> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let record = TransferRecord::new(transfer_id.clone(), client_id, file_path);

        self.store
            .hash_set(&keys::transfer_key(&transfer_id), &record.persisted_fields())
            .await?;

        let now = Instant::now();
        self.transfers.write().await.insert(
            transfer_id.clone(),
            TransferEntry {
                record,
                slots: BTreeMap::new(),
                started: now,
                last_activity: now,
                assembling: false,
            },
        );

        info!(
            download_id = %transfer_id,
            client_id = %client_id,
            file_path = %file_path,
            "Transfer initiated"
        );
        Ok(transfer_id)
    }

    /// Apply the agent's `file_metadata`
    pub async fn on_metadata(
        &self,
        transfer_id: &str,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        let snapshot = {
            let mut transfers = self.transfers.write().await;
            let entry = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;

            if entry.record.status != TransferStatus::Initiated {
                debug!(
                    download_id = %transfer_id,
                    status = %entry.record.status,
                    "Ignoring metadata for transfer past initiation"
                );
                return Ok(());
            }

            // Every chunk but a lone empty one carries at least one byte
            if total_chunks == 0 || u64::from(total_chunks) > file_size.max(1) {
                drop(transfers);
                return self
                    .fail(
                        transfer_id,
                        &format!(
                            "Invalid metadata: {} chunks for {} bytes",
                            total_chunks, file_size
                        ),
                    )
                    .await;
            }

            entry.record.status = TransferStatus::Downloading;
            entry.record.file_name = Some(file_name.to_string());
            entry.record.file_size = Some(file_size);
            entry.record.total_chunks = Some(total_chunks);
            entry.touch();
            entry.record.clone()
        };

        info!(
            download_id = %transfer_id,
            file_name = %file_name,
            file_size,
            total_chunks,
            "Receiving file"
        );
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Store one chunk; completes the transfer when `is_last` is set
    pub async fn on_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u32,
        data: &str,
        is_last: bool,
    ) -> Result<(), TransferError> {
        let snapshot = {
            let mut transfers = self.transfers.write().await;
            let entry = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;

            if entry.record.status.is_terminal() || entry.assembling {
                debug!(
                    download_id = %transfer_id,
                    chunk_index,
                    "Ignoring chunk for finished transfer"
                );
                return Ok(());
            }

            let total_chunks = entry.record.total_chunks.unwrap_or(0);
            if chunk_index >= total_chunks {
                warn!(
                    download_id = %transfer_id,
                    chunk_index,
                    total_chunks,
                    "Dropping out-of-range chunk"
                );
                return Ok(());
            }

            let payload = match decode_chunk(data) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        download_id = %transfer_id,
                        chunk_index,
                        "Dropping chunk: {}", e
                    );
                    return Ok(());
                }
            };

            if entry.slots.insert(chunk_index, payload).is_none() {
                entry.record.received_chunks += 1;
            }
            let total = u64::from(total_chunks);
            entry.record.progress =
                (u64::from(entry.record.received_chunks) * 100 / total).min(100) as u8;
            entry.touch();

            debug!(
                download_id = %transfer_id,
                chunk_index,
                received = entry.record.received_chunks,
                total,
                is_last,
                "Stored chunk"
            );
            entry.record.clone()
        };

        if is_last {
            self.complete(transfer_id).await
        } else {
            self.persist(&snapshot).await;
            Ok(())
        }
    }

    /// Assemble the chunks in index order and write the output file
    ///
    /// Runs at most once per transfer. Missing slots contribute nothing
    /// unless strict completion is configured, in which case a gap fails the
    /// transfer instead.
    pub async fn complete(&self, transfer_id: &str) -> Result<(), TransferError> {
        let (client_id, file_name, slots, started) = {
            let mut transfers = self.transfers.write().await;
            let entry = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;

            if entry.record.status.is_terminal() || entry.assembling {
                return Ok(());
            }

            let total = entry.record.total_chunks.unwrap_or(0);
            if self.config.strict_completion && entry.record.received_chunks != total {
                let reason = format!(
                    "Incomplete transfer: received {} of {} chunks",
                    entry.record.received_chunks, total
                );
                drop(transfers);
                return self.fail(transfer_id, &reason).await;
            }

            entry.assembling = true;
            (
                entry.record.client_id.clone(),
                entry.record.file_name.clone(),
                std::mem::take(&mut entry.slots),
                entry.started,
            )
        };

        let output_path = output_path(
            &self.config.download_dir,
            &client_id,
            transfer_id,
            file_name.as_deref().unwrap_or_default(),
        );

        let mut assembled = BytesMut::with_capacity(slots.values().map(Bytes::len).sum());
        for chunk in slots.into_values() {
            assembled.extend_from_slice(&chunk);
        }

        if let Err(e) = write_output(&output_path, &assembled).await {
            error!(
                download_id = %transfer_id,
                path = %output_path.display(),
                "Failed to write transfer output: {}", e
            );
            self.fail_entry(transfer_id, &format!("Failed to write output: {}", e), true)
                .await?;
            return Err(TransferError::Io(e));
        }

        let snapshot = {
            let mut transfers = self.transfers.write().await;
            let entry = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;

            entry.assembling = false;
            if entry.record.status.is_terminal() {
                debug!(
                    download_id = %transfer_id,
                    status = %entry.record.status,
                    "Transfer finished while its output was being written"
                );
                return Ok(());
            }

            let duration = entry.started.elapsed();
            entry.record.status = TransferStatus::Completed;
            entry.record.completed_at = Some(Utc::now());
            entry.record.duration_ms = Some(duration.as_millis() as u64);
            entry.record.output_path = Some(output_path.clone());
            entry.touch();
            entry.record.clone()
        };

        info!(
            download_id = %transfer_id,
            client_id = %client_id,
            bytes = assembled.len(),
            duration_ms = snapshot.duration_ms.unwrap_or_default(),
            path = %output_path.display(),
            "Transfer completed"
        );
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Mark a transfer failed and release its buffers
    ///
    /// A transfer that already reached a terminal state, or whose output is
    /// being written, is left untouched.
    pub async fn fail(&self, transfer_id: &str, reason: &str) -> Result<(), TransferError> {
        self.fail_entry(transfer_id, reason, false).await
    }

    /// `during_assembly` is only set by [`complete`](Self::complete) itself
    async fn fail_entry(
        &self,
        transfer_id: &str,
        reason: &str,
        during_assembly: bool,
    ) -> Result<(), TransferError> {
        let snapshot = {
            let mut transfers = self.transfers.write().await;
            let entry = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;

            if entry.record.status.is_terminal() {
                debug!(
                    download_id = %transfer_id,
                    status = %entry.record.status,
                    "Ignoring failure for finished transfer"
                );
                return Ok(());
            }
            if entry.assembling && !during_assembly {
                debug!(
                    download_id = %transfer_id,
                    "Ignoring failure for transfer being assembled"
                );
                return Ok(());
            }

            entry.assembling = false;
            entry.slots.clear();
            entry.record.status = TransferStatus::Failed;
            entry.record.error = Some(reason.to_string());
            entry.record.completed_at = Some(Utc::now());
            entry.record.duration_ms = Some(entry.started.elapsed().as_millis() as u64);
            entry.touch();
            entry.record.clone()
        };

        warn!(
            download_id = %transfer_id,
            client_id = %snapshot.client_id,
            "Transfer failed: {}", reason
        );
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Client the transfer was requested from
    pub async fn owner(&self, transfer_id: &str) -> Option<String> {
        self.transfers
            .read()
            .await
            .get(transfer_id)
            .map(|e| e.record.client_id.clone())
    }

    pub async fn get_status(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.transfers
            .read()
            .await
            .get(transfer_id)
            .map(|e| e.record.clone())
    }

    /// All transfers, oldest first
    pub async fn list_all(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .transfers
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        records
    }

    /// Fail every in-flight transfer idle since before `now - timeout`
    ///
    /// Does nothing unless a transfer timeout is configured. Returns the ids
    /// that were failed.
    pub async fn reap_stale(&self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.config.transfer_timeout else {
            return Vec::new();
        };

        let stale: Vec<String> = self
            .transfers
            .read()
            .await
            .iter()
            .filter(|(_, e)| {
                !e.record.status.is_terminal()
                    && !e.assembling
                    && now.saturating_duration_since(e.last_activity) >= timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for transfer_id in &stale {
            let reason = format!("Transfer timed out after {}s of inactivity", timeout.as_secs());
            if let Err(e) = self.fail(transfer_id, &reason).await {
                warn!(download_id = %transfer_id, "Failed to reap transfer: {}", e);
            }
        }

        stale
    }

    async fn persist(&self, record: &TransferRecord) {
        if let Err(e) = self
            .store
            .hash_set(
                &keys::transfer_key(&record.transfer_id),
                &record.persisted_fields(),
            )
            .await
        {
            warn!(
                download_id = %record.transfer_id,
                "Failed to persist transfer state: {}", e
            );
        }
    }
}

/// `<download_dir>/<client_id>/<transfer_id>_<file name>`
fn output_path(download_dir: &Path, client_id: &str, transfer_id: &str, file_name: &str) -> PathBuf {
    download_dir
        .join(path_component(client_id, "unknown-client"))
        .join(format!(
            "{}_{}",
            transfer_id,
            path_component(file_name, "download")
        ))
}

/// Reduce an agent-supplied name to a single safe path component
fn path_component(name: &str, fallback: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        fallback.to_string()
    } else {
        base.to_string()
    }
}

async fn write_output(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::encode_chunk;
    use backhaul_store::MemoryStore;
    use std::collections::HashSet;

    fn create_coordinator(dir: &Path) -> (TransferCoordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = TransferConfig {
            download_dir: dir.to_path_buf(),
            ..Default::default()
        };
        (TransferCoordinator::new(store.clone(), config), store)
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_assemble_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/data/report.bin").await.unwrap();
        coordinator.on_metadata(&id, "report.bin", 9, 3).await.unwrap();

        coordinator.on_chunk(&id, 1, &encode_chunk(b"bbb"), false).await.unwrap();
        coordinator.on_chunk(&id, 0, &encode_chunk(b"aaa"), false).await.unwrap();
        coordinator.on_chunk(&id, 2, &encode_chunk(b"ccc"), true).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.received_chunks, 3);
        assert_eq!(record.progress, 100);

        let expected = dir.path().join("site-1").join(format!("{}_report.bin", id));
        assert_eq!(record.output_path.as_deref(), Some(expected.as_path()));
        assert_eq!(std::fs::read(&expected).unwrap(), b"aaabbbccc");

        assert_eq!(
            store.hash_field(&keys::transfer_key(&id), "status").as_deref(),
            Some("completed")
        );
    }

    #[tokio::test]
    async fn test_initiate_never_reuses_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let mut ids = HashSet::new();
        for _ in 0..200 {
            assert!(ids.insert(coordinator.initiate("site-1", "/a").await.unwrap()));
        }
        assert_eq!(coordinator.list_all().await.len(), 200);
    }

    #[tokio::test]
    async fn test_initiate_fails_when_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = create_coordinator(dir.path());
        store.set_available(false);

        assert!(matches!(
            coordinator.initiate("site-1", "/a").await,
            Err(TransferError::Persistence(_))
        ));
        assert!(coordinator.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        assert!(matches!(
            coordinator.on_metadata("nope", "a", 1, 1).await,
            Err(TransferError::UnknownTransfer(_))
        ));
        assert!(matches!(
            coordinator.on_chunk("nope", 0, "", true).await,
            Err(TransferError::UnknownTransfer(_))
        ));
        assert!(coordinator.get_status("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_chunk_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        coordinator.on_metadata(&id, "a", 8, 4).await.unwrap();
        coordinator.on_chunk(&id, 0, &encode_chunk(b"xx"), false).await.unwrap();
        coordinator.on_chunk(&id, 0, &encode_chunk(b"xx"), false).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.received_chunks, 1);
        assert_eq!(record.progress, 25);
        assert_eq!(record.status, TransferStatus::Downloading);
    }

    #[tokio::test]
    async fn test_bad_chunks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        coordinator.on_metadata(&id, "a", 4, 2).await.unwrap();
        coordinator.on_chunk(&id, 5, &encode_chunk(b"zz"), false).await.unwrap();
        coordinator.on_chunk(&id, 1, "not base64!", false).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.received_chunks, 0);
        assert_eq!(record.status, TransferStatus::Downloading);
    }

    #[tokio::test]
    async fn test_last_flag_completes_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a.txt").await.unwrap();
        coordinator.on_metadata(&id, "a.txt", 6, 3).await.unwrap();
        coordinator.on_chunk(&id, 0, &encode_chunk(b"aa"), false).await.unwrap();
        coordinator.on_chunk(&id, 2, &encode_chunk(b"cc"), true).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.progress, 66);
        assert_eq!(std::fs::read(record.output_path.unwrap()).unwrap(), b"aacc");
    }

    #[tokio::test]
    async fn test_strict_completion_fails_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let coordinator = TransferCoordinator::new(
            store,
            TransferConfig {
                download_dir: dir.path().to_path_buf(),
                strict_completion: true,
                transfer_timeout: None,
            },
        );

        let id = coordinator.initiate("site-1", "/a.txt").await.unwrap();
        coordinator.on_metadata(&id, "a.txt", 6, 3).await.unwrap();
        coordinator.on_chunk(&id, 2, &encode_chunk(b"cc"), true).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.error.unwrap().contains("1 of 3"));
        assert!(record.output_path.is_none());
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/empty").await.unwrap();
        coordinator.on_metadata(&id, "empty", 0, 1).await.unwrap();
        coordinator.on_chunk(&id, 0, "", true).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(std::fs::read(record.output_path.unwrap()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_fails_transfer() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the client directory should go
        std::fs::write(dir.path().join("site-1"), b"in the way").unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        coordinator.on_metadata(&id, "a", 1, 1).await.unwrap();
        let result = coordinator.on_chunk(&id, 0, &encode_chunk(b"x"), true).await;
        assert!(matches!(result, Err(TransferError::Io(_))));

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        coordinator.fail(&id, "agent error").await.unwrap();

        coordinator.on_metadata(&id, "a", 1, 1).await.unwrap();
        coordinator.on_chunk(&id, 0, &encode_chunk(b"x"), true).await.unwrap();
        coordinator.fail(&id, "again").await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("agent error"));
        assert!(record.file_name.is_none());
    }

    #[tokio::test]
    async fn test_invalid_metadata_fails_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        coordinator.on_metadata(&id, "a", 10, u32::MAX).await.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_huge_chunk_count_is_not_preallocated() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/huge").await.unwrap();
        coordinator
            .on_metadata(&id, "huge", 1_000_000_000_000, 4_000_000_000)
            .await
            .unwrap();
        coordinator
            .on_chunk(&id, 3_999_999_999, &encode_chunk(b"tail"), false)
            .await
            .unwrap();
        coordinator
            .on_chunk(&id, 4_000_000_000, &encode_chunk(b"past"), false)
            .await
            .unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Downloading);
        assert_eq!(record.total_chunks, Some(4_000_000_000));
        assert_eq!(record.received_chunks, 1);
        assert_eq!(record.progress, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failure_during_assembly_does_not_override_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a.txt").await.unwrap();
        coordinator.on_metadata(&id, "a.txt", 3, 1).await.unwrap();

        let data = encode_chunk(b"abc");
        let (completed, failed) = tokio::join!(
            coordinator.on_chunk(&id, 0, &data, true),
            async {
                // Let the last chunk start writing the output first
                tokio::task::yield_now().await;
                coordinator.fail(&id, "agent error").await
            }
        );
        completed.unwrap();
        failed.unwrap();

        let record = coordinator.get_status(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(record.error.is_none());
        assert_eq!(std::fs::read(record.output_path.unwrap()).unwrap(), b"abc");

        coordinator.fail(&id, "late").await.unwrap();
        assert_eq!(
            coordinator.get_status(&id).await.unwrap().status,
            TransferStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());

        let id = coordinator.initiate("site-1", "/a").await.unwrap();
        assert_eq!(coordinator.owner(&id).await.as_deref(), Some("site-1"));
        assert!(coordinator.owner("nope").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_stale_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = TransferCoordinator::new(
            Arc::new(MemoryStore::new()),
            TransferConfig {
                download_dir: dir.path().to_path_buf(),
                strict_completion: false,
                transfer_timeout: Some(Duration::from_secs(60)),
            },
        );

        let idle = coordinator.initiate("site-1", "/idle").await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        let busy = coordinator.initiate("site-1", "/busy").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let reaped = coordinator.reap_stale(Instant::now()).await;
        assert_eq!(reaped, vec![idle.clone()]);
        assert_eq!(
            coordinator.get_status(&idle).await.unwrap().status,
            TransferStatus::Failed
        );
        assert_eq!(
            coordinator.get_status(&busy).await.unwrap().status,
            TransferStatus::Initiated
        );
    }

    #[tokio::test]
    async fn test_reap_disabled_without_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store) = create_coordinator(dir.path());
        coordinator.initiate("site-1", "/a").await.unwrap();

        let later = Instant::now() + Duration::from_secs(86_400);
        assert!(coordinator.reap_stale(later).await.is_empty());
    }

    #[test]
    fn test_output_path_strips_directories() {
        let root = Path::new("/srv/downloads");
        assert_eq!(
            output_path(root, "site-1", "t1", "../../etc/passwd"),
            PathBuf::from("/srv/downloads/site-1/t1_passwd")
        );
        assert_eq!(
            output_path(root, "site-1", "t1", "C:\\logs\\app.log"),
            PathBuf::from("/srv/downloads/site-1/t1_app.log")
        );
        assert_eq!(
            output_path(root, "..", "t1", ""),
            PathBuf::from("/srv/downloads/unknown-client/t1_download")
        );
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = TransferRecord::new("t1".to_string(), "site-1", "/a");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["downloadId"], "t1");
        assert_eq!(json["clientId"], "site-1");
        assert_eq!(json["status"], "initiated");
        assert_eq!(json["receivedChunks"], 0);
        assert!(json.get("fileName").is_none());
    }
}
