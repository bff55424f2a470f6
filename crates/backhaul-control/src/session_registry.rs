//! Session registry for tracking which agent currently owns a live tunnel
//!
//! The in-memory map is authoritative for routing; every change is also
//! mirrored into the remote store (a hash of client id -> registration time
//! plus a short-lived liveness marker per client) so other replicas can see
//! who is connected.
//!
//! Each mutation holds the registry's write lock across both the local
//! update and the remote write, so two operations on the same client cannot
//! interleave between the phases. A failed remote write leaves the local map
//! untouched and surfaces as [`RegistryError::Persistence`]; there is no
//! silent memory-only fallback. [`SessionRegistry::reconcile`] heals whatever
//! divergence is left behind by a crash or an external edit of the store.

use backhaul_store::{keys, RemoteStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::connection::TunnelHandle;

/// Default TTL of the per-client liveness marker
pub const DEFAULT_LIVENESS_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

/// A registered agent and the tunnel that reaches it
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    pub handle: TunnelHandle,
    pub registered_at: DateTime<Utc>,
}

/// Entry of [`SessionRegistry::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of a [`SessionRegistry::reconcile`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Local sessions whose mirror entries had to be rewritten
    pub restored: Vec<String>,
    /// Remote entries removed because nothing keeps them alive
    pub pruned: Vec<String>,
}

/// Registry of live agent sessions
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    store: Arc<dyn RemoteStore>,
    liveness_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        tracing::info!("Creating new session registry");
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            liveness_ttl: DEFAULT_LIVENESS_TTL,
        }
    }

    pub fn with_liveness_ttl(mut self, ttl: Duration) -> Self {
        self.liveness_ttl = ttl;
        self
    }

    pub fn liveness_ttl(&self) -> Duration {
        self.liveness_ttl
    }

    /// Register a tunnel for `client_id`, replacing any existing one
    ///
    /// Last write wins: the superseded tunnel is not closed, it simply stops
    /// being reachable through the registry. Returns the replaced session.
    pub async fn register(
        &self,
        client_id: &str,
        handle: TunnelHandle,
    ) -> Result<Option<Session>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let registered_at = Utc::now();

        self.mirror(client_id, registered_at).await?;

        let session = Session {
            client_id: client_id.to_string(),
            handle,
            registered_at,
        };
        let replaced = sessions.insert(client_id.to_string(), session);

        if let Some(ref old) = replaced {
            tracing::info!(
                client_id = %client_id,
                old_connection = %old.handle.connection_id(),
                old_registered_at = %old.registered_at,
                "Re-registered existing client (replaced previous tunnel)"
            );
        } else {
            tracing::info!(client_id = %client_id, "Registered new client");
        }

        Ok(replaced)
    }

    /// Remove the session for `client_id` and its mirror entries
    pub async fn unregister(&self, client_id: &str) -> Result<Option<Session>, RegistryError> {
        let mut sessions = self.sessions.write().await;

        self.unmirror(client_id).await?;
        let session = sessions.remove(client_id);

        if session.is_some() {
            tracing::info!(client_id = %client_id, "Unregistered client");
        } else {
            tracing::debug!(client_id = %client_id, "Unregistered client with no local session");
        }

        Ok(session)
    }

    /// Unregister only if the current session belongs to `connection_id`
    ///
    /// A tunnel that was superseded by a newer registration must not evict
    /// its replacement when it finally closes.
    pub async fn unregister_if_current(
        &self,
        client_id: &str,
        connection_id: &str,
    ) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;

        let is_current = sessions
            .get(client_id)
            .is_some_and(|s| s.handle.connection_id() == connection_id);
        if !is_current {
            tracing::debug!(
                client_id = %client_id,
                connection_id = %connection_id,
                "Skipping unregister of superseded tunnel"
            );
            return Ok(false);
        }

        self.unmirror(client_id).await?;
        sessions.remove(client_id);
        tracing::info!(client_id = %client_id, "Unregistered client");

        Ok(true)
    }

    /// Extend the liveness marker of a registered client
    ///
    /// Returns false when the client has no local session.
    pub async fn refresh(&self, client_id: &str) -> Result<bool, RegistryError> {
        let sessions = self.sessions.read().await;
        if !sessions.contains_key(client_id) {
            return Ok(false);
        }

        self.store
            .set_with_ttl(
                &keys::client_alive_key(client_id),
                &Utc::now().to_rfc3339(),
                self.liveness_ttl,
            )
            .await?;
        Ok(true)
    }

    /// Whether `client_id` is reachable right now
    ///
    /// Both the local tunnel and the remote liveness marker must be present;
    /// a stale marker from another replica is not enough, and neither is a
    /// local handle whose marker has lapsed.
    pub async fn is_connected(&self, client_id: &str) -> Result<bool, RegistryError> {
        let sessions = self.sessions.read().await;
        let alive = self
            .store
            .exists(&keys::client_alive_key(client_id))
            .await?;
        Ok(alive && sessions.contains_key(client_id))
    }

    /// Tunnel handle for routing a work request to `client_id`
    pub async fn get(&self, client_id: &str) -> Option<TunnelHandle> {
        self.sessions
            .read()
            .await
            .get(client_id)
            .map(|s| s.handle.clone())
    }

    /// Connected clients as recorded in the remote store
    pub async fn list(&self) -> Result<Vec<SessionInfo>, RegistryError> {
        let entries = self.store.hash_get_all(keys::CLIENTS_KEY).await?;

        let sessions = entries
            .into_iter()
            .filter_map(|(client_id, timestamp)| {
                match DateTime::parse_from_rfc3339(&timestamp) {
                    Ok(ts) => Some(SessionInfo {
                        client_id,
                        connected_at: ts.with_timezone(&Utc),
                    }),
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client_id,
                            "Ignoring unparseable registration timestamp '{}': {}",
                            timestamp,
                            e
                        );
                        None
                    }
                }
            })
            .collect();

        Ok(sessions)
    }

    /// Number of local sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Bring the mirror back in line with the local sessions
    ///
    /// Local sessions missing from the mirror are written back. Mirror
    /// entries with no local session are only removed once their liveness
    /// marker is gone, since a live marker may belong to another replica.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RegistryError> {
        let sessions = self.sessions.write().await;
        let mut report = ReconcileReport::default();

        let mirrored: HashMap<String, String> = self
            .store
            .hash_get_all(keys::CLIENTS_KEY)
            .await?
            .into_iter()
            .collect();

        for session in sessions.values() {
            let alive = self
                .store
                .exists(&keys::client_alive_key(&session.client_id))
                .await?;
            if !alive || !mirrored.contains_key(&session.client_id) {
                self.mirror(&session.client_id, session.registered_at)
                    .await?;
                report.restored.push(session.client_id.clone());
            }
        }

        for client_id in mirrored.keys() {
            if sessions.contains_key(client_id) {
                continue;
            }
            let alive = self
                .store
                .exists(&keys::client_alive_key(client_id))
                .await?;
            if !alive {
                self.store.hash_delete(keys::CLIENTS_KEY, client_id).await?;
                report.pruned.push(client_id.clone());
            }
        }

        if !report.restored.is_empty() || !report.pruned.is_empty() {
            tracing::info!(
                restored = ?report.restored,
                pruned = ?report.pruned,
                "Reconciled session mirror"
            );
        }

        Ok(report)
    }

    async fn mirror(&self, client_id: &str, registered_at: DateTime<Utc>) -> Result<(), StoreError> {
        let timestamp = registered_at.to_rfc3339();
        self.store
            .hash_set(
                keys::CLIENTS_KEY,
                &[(client_id.to_string(), timestamp.clone())],
            )
            .await?;
        self.store
            .set_with_ttl(
                &keys::client_alive_key(client_id),
                &timestamp,
                self.liveness_ttl,
            )
            .await
    }

    async fn unmirror(&self, client_id: &str) -> Result<(), StoreError> {
        self.store.hash_delete(keys::CLIENTS_KEY, client_id).await?;
        self.store.delete(&keys::client_alive_key(client_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_store::MemoryStore;
    use tokio::sync::mpsc;

    fn create_registry() -> (Arc<SessionRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(store.clone()));
        (registry, store)
    }

    fn create_handle(connection_id: &str) -> (TunnelHandle, mpsc::Receiver<tokio_tungstenite::tungstenite::Message>) {
        let (tx, rx) = mpsc::channel(8);
        (TunnelHandle::new(connection_id, tx), rx)
    }

    #[tokio::test]
    async fn test_register_client() {
        let (registry, store) = create_registry();
        let (handle, _rx) = create_handle("conn-1");

        let replaced = registry.register("site-1", handle).await.unwrap();
        assert!(replaced.is_none());

        assert!(registry.is_connected("site-1").await.unwrap());
        assert_eq!(registry.count().await, 1);
        assert!(store.exists(&keys::client_alive_key("site-1")).await.unwrap());

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].client_id, "site-1");
    }

    #[tokio::test]
    async fn test_register_twice_keeps_newest_handle() {
        let (registry, _store) = create_registry();
        let (first, _rx1) = create_handle("conn-1");
        let (second, _rx2) = create_handle("conn-2");

        registry.register("site-1", first).await.unwrap();
        let replaced = registry.register("site-1", second).await.unwrap();

        assert_eq!(replaced.unwrap().handle.connection_id(), "conn-1");
        assert_eq!(registry.count().await, 1);
        assert_eq!(
            registry.get("site-1").await.unwrap().connection_id(),
            "conn-2"
        );
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_client() {
        let (registry, store) = create_registry();
        let (handle, _rx) = create_handle("conn-1");
        registry.register("site-1", handle).await.unwrap();

        let removed = registry.unregister("site-1").await.unwrap();
        assert_eq!(removed.unwrap().client_id, "site-1");

        assert!(!registry.is_connected("site-1").await.unwrap());
        assert!(registry.get("site-1").await.is_none());
        assert!(registry.list().await.unwrap().is_empty());
        assert!(!store.exists(&keys::client_alive_key("site-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_nonexistent_client() {
        let (registry, _store) = create_registry();
        assert!(registry.unregister("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_if_current_ignores_superseded_tunnel() {
        let (registry, _store) = create_registry();
        let (old, _rx1) = create_handle("conn-old");
        let (new, _rx2) = create_handle("conn-new");

        registry.register("site-1", old).await.unwrap();
        registry.register("site-1", new).await.unwrap();

        assert!(!registry
            .unregister_if_current("site-1", "conn-old")
            .await
            .unwrap());
        assert!(registry.is_connected("site-1").await.unwrap());

        assert!(registry
            .unregister_if_current("site-1", "conn-new")
            .await
            .unwrap());
        assert!(!registry.is_connected("site-1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_liveness_marker_means_disconnected() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            SessionRegistry::new(store.clone()).with_liveness_ttl(Duration::from_secs(30));
        let (handle, _rx) = create_handle("conn-1");
        registry.register("site-1", handle).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.refresh("site-1").await.unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.is_connected("site-1").await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!registry.is_connected("site-1").await.unwrap());
        // The handle itself is never evicted by the TTL
        assert!(registry.get("site-1").await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_unknown_client() {
        let (registry, _store) = create_registry();
        assert!(!registry.refresh("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_fails_loudly() {
        let (registry, store) = create_registry();
        let (handle, _rx) = create_handle("conn-1");
        store.set_available(false);

        assert!(matches!(
            registry.register("site-1", handle).await,
            Err(RegistryError::Persistence(_))
        ));
        assert_eq!(registry.count().await, 0);
        assert!(registry.is_connected("site-1").await.is_err());
        assert!(registry.list().await.is_err());
        assert!(registry.unregister("site-1").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_unregister_stay_consistent() {
        let (registry, store) = create_registry();

        for round in 0..50 {
            let (handle, _rx) = create_handle(&format!("conn-{}", round));
            let r1 = registry.clone();
            let r2 = registry.clone();

            let register = tokio::spawn(async move { r1.register("site-1", handle).await });
            let unregister = tokio::spawn(async move { r2.unregister("site-1").await });
            register.await.unwrap().unwrap();
            unregister.await.unwrap().unwrap();

            let local = registry.get("site-1").await.is_some();
            let mirrored = store
                .hash_get_all(keys::CLIENTS_KEY)
                .await
                .unwrap()
                .iter()
                .any(|(id, _)| id == "site-1");
            assert_eq!(local, mirrored, "round {}", round);
            assert_eq!(local, registry.is_connected("site-1").await.unwrap());

            registry.unregister("site-1").await.unwrap();
            assert!(!registry.is_connected("site-1").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_reconcile_restores_and_prunes() {
        let (registry, store) = create_registry();
        let (handle, _rx) = create_handle("conn-1");
        registry.register("site-1", handle).await.unwrap();

        // Mirror loses the live client, and gains a dead one
        store
            .hash_delete(keys::CLIENTS_KEY, "site-1")
            .await
            .unwrap();
        store
            .hash_set(
                keys::CLIENTS_KEY,
                &[("site-9".to_string(), Utc::now().to_rfc3339())],
            )
            .await
            .unwrap();

        let report = registry.reconcile().await.unwrap();
        assert_eq!(report.restored, vec!["site-1".to_string()]);
        assert_eq!(report.pruned, vec!["site-9".to_string()]);

        let ids: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.client_id)
            .collect();
        assert_eq!(ids, vec!["site-1".to_string()]);

        assert_eq!(registry.reconcile().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_other_replica_entries() {
        let (registry, store) = create_registry();
        store
            .hash_set(
                keys::CLIENTS_KEY,
                &[("site-7".to_string(), Utc::now().to_rfc3339())],
            )
            .await
            .unwrap();
        store
            .set_with_ttl(&keys::client_alive_key("site-7"), "x", Duration::from_secs(60))
            .await
            .unwrap();

        let report = registry.reconcile().await.unwrap();
        assert!(report.pruned.is_empty());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }
}
