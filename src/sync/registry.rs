//! Session registry backed by `(:Session)` nodes

use super::cutoff;
use crate::neo4j::{GraphStore, SessionNode};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Registration and liveness of one session, plus lookup of its peers.
///
/// Peers are always read from the store; nothing is cached locally.
pub struct SessionRegistry {
    store: Arc<dyn GraphStore>,
    session_id: String,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn GraphStore>, session_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            ttl,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn register(&self) -> Result<()> {
        self.store
            .register_session(&self.session_id)
            .await
            .with_context(|| format!("Failed to register session {}", self.session_id))?;
        tracing::info!(session_id = %self.session_id, "Session registered");
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.store
            .touch_session(&self.session_id)
            .await
            .context("Session heartbeat failed")
    }

    pub async fn deregister(&self) -> Result<()> {
        self.store
            .remove_session(&self.session_id)
            .await
            .with_context(|| format!("Failed to deregister session {}", self.session_id))?;
        tracing::info!(session_id = %self.session_id, "Session deregistered");
        Ok(())
    }

    /// Sessions seen within the TTL, this one included
    pub async fn active_sessions(&self) -> Result<Vec<SessionNode>> {
        self.store
            .list_active_sessions(cutoff(Utc::now(), self.ttl))
            .await
            .context("Failed to read session registry")
    }

    /// Every active session except this one
    pub async fn propagation_targets(&self) -> Result<Vec<String>> {
        Ok(self
            .active_sessions()
            .await?
            .into_iter()
            .map(|s| s.session_id)
            .filter(|id| *id != self.session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neo4j::mock::MockGraphStore;

    #[tokio::test]
    async fn test_targets_exclude_self() {
        let store = Arc::new(MockGraphStore::new().with_sessions(&["X", "Y", "Z"]).await);
        let registry = SessionRegistry::new(store, "X", Duration::from_secs(300));
        assert_eq!(registry.propagation_targets().await.unwrap(), vec!["Y", "Z"]);
    }

    #[tokio::test]
    async fn test_stale_sessions_are_not_targets() {
        let store = Arc::new(MockGraphStore::new().with_sessions(&["X", "Y", "Z"]).await);
        store
            .set_last_seen("Z", Utc::now() - chrono::Duration::minutes(10))
            .await;
        let registry = SessionRegistry::new(store, "X", Duration::from_secs(300));
        assert_eq!(registry.propagation_targets().await.unwrap(), vec!["Y"]);
    }

    #[tokio::test]
    async fn test_register_heartbeat_deregister() {
        let store = Arc::new(MockGraphStore::new());
        let registry = SessionRegistry::new(store.clone(), "X", Duration::from_secs(300));

        registry.register().await.unwrap();
        assert_eq!(registry.active_sessions().await.unwrap().len(), 1);

        registry.heartbeat().await.unwrap();
        assert_eq!(
            store.heartbeats.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        registry.deregister().await.unwrap();
        assert!(registry.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_failure_is_reported() {
        let store = Arc::new(MockGraphStore::new());
        store
            .fail_session_listing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let registry = SessionRegistry::new(store, "X", Duration::from_secs(300));
        let err = registry.propagation_targets().await.unwrap_err();
        assert!(format!("{:#}", err).contains("session registry"));
    }
}
