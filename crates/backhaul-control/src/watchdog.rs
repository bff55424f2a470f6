//! Periodic maintenance tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session_registry::SessionRegistry;
use crate::transfer::TransferCoordinator;

/// Periodically fail transfers that stopped making progress
///
/// Returns `None` when no transfer timeout is configured.
pub fn spawn_transfer_reaper(
    transfers: Arc<TransferCoordinator>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let timeout = transfers.config().transfer_timeout?;
    debug!("Transfer reaper enabled (timeout {:?}, period {:?})", timeout, period);

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let now = interval.tick().await;
            let reaped = transfers.reap_stale(now).await;
            if !reaped.is_empty() {
                warn!(count = reaped.len(), "Timed out stale transfers");
            }
        }
    }))
}

/// Periodically heal divergence between local sessions and the store mirror
pub fn spawn_reconcile_task(registry: Arc<SessionRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; nothing to heal yet
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = registry.reconcile().await {
                warn!("Session reconcile failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{TransferConfig, TransferStatus};
    use backhaul_store::MemoryStore;

    #[tokio::test]
    async fn test_reaper_disabled_without_timeout() {
        let transfers = Arc::new(TransferCoordinator::new(
            Arc::new(MemoryStore::new()),
            TransferConfig::default(),
        ));
        assert!(spawn_transfer_reaper(transfers, Duration::from_secs(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_fails_idle_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let transfers = Arc::new(TransferCoordinator::new(
            Arc::new(MemoryStore::new()),
            TransferConfig {
                download_dir: dir.path().to_path_buf(),
                strict_completion: false,
                transfer_timeout: Some(Duration::from_secs(30)),
            },
        ));
        let id = transfers.initiate("site-1", "/a").await.unwrap();

        let task = spawn_transfer_reaper(transfers.clone(), Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(36)).await;

        assert_eq!(
            transfers.get_status(&id).await.unwrap().status,
            TransferStatus::Failed
        );
        task.abort();
    }
}
