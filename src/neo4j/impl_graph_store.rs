//! `GraphStore` implementation for `Neo4jClient`.
//!
//! Every method simply delegates to the corresponding inherent method on `Neo4jClient`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::client::Neo4jClient;
use super::models::*;
use super::traits::GraphStore;
use crate::cypher::Statement;

#[async_trait]
impl GraphStore for Neo4jClient {
    // ========================================================================
    // Building graph
    // ========================================================================

    async fn execute_statement(&self, statement: &Statement) -> anyhow::Result<()> {
        self.execute_statement(statement).await
    }

    // ========================================================================
    // Session registry
    // ========================================================================

    async fn register_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.register_session(session_id).await
    }

    async fn touch_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.touch_session(session_id).await
    }

    async fn remove_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.remove_session(session_id).await
    }

    async fn list_active_sessions(
        &self,
        active_since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SessionNode>> {
        self.list_active_sessions(active_since).await
    }

    // ========================================================================
    // ChangeLog
    // ========================================================================

    async fn create_change_log(&self, entry: &ChangeLogEntry) -> anyhow::Result<i64> {
        self.create_change_log(entry).await
    }

    async fn count_recent_unacknowledged(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<ChangeProbe> {
        self.count_recent_unacknowledged(session_id, since).await
    }

    async fn probe_unacknowledged_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> anyhow::Result<ChangeProbe> {
        self.probe_unacknowledged_after(session_id, after_seq).await
    }

    async fn list_unacknowledged(&self, session_id: &str) -> anyhow::Result<Vec<ChangeLogEntry>> {
        self.list_unacknowledged(session_id).await
    }

    async fn acknowledge_change_logs(
        &self,
        session_id: &str,
        up_to_seq: Option<i64>,
    ) -> anyhow::Result<u64> {
        self.acknowledge_change_logs(session_id, up_to_seq).await
    }

    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        self.purge_acknowledged(older_than).await
    }
}
