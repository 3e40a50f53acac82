//! GraphStore trait definition
//!
//! Abstract interface over the Neo4j operations the sync core needs.
//! Mirrors the public async methods of `Neo4jClient` so the coordinator,
//! dispatcher and listener can be tested against an in-memory store.

use crate::cypher::Statement;
use crate::neo4j::models::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Building graph
    // ========================================================================

    /// Execute one generated statement
    async fn execute_statement(&self, statement: &Statement) -> Result<()>;

    // ========================================================================
    // Session registry
    // ========================================================================

    /// Create or refresh the session node
    async fn register_session(&self, session_id: &str) -> Result<()>;

    /// Heartbeat: bump `lastSeen`
    async fn touch_session(&self, session_id: &str) -> Result<()>;

    /// Remove the session node
    async fn remove_session(&self, session_id: &str) -> Result<()>;

    /// Sessions whose `lastSeen` is at or after `active_since`
    async fn list_active_sessions(&self, active_since: DateTime<Utc>) -> Result<Vec<SessionNode>>;

    // ========================================================================
    // ChangeLog
    // ========================================================================

    /// Persist an entry and return the `seq` assigned to it
    async fn create_change_log(&self, entry: &ChangeLogEntry) -> Result<i64>;

    /// Unacknowledged entries for `session_id` newer than `since`
    async fn count_recent_unacknowledged(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ChangeProbe>;

    /// Unacknowledged entries for `session_id` with `seq > after_seq`
    async fn probe_unacknowledged_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<ChangeProbe>;

    /// All unacknowledged entries for `session_id`, ordered by `seq`
    async fn list_unacknowledged(&self, session_id: &str) -> Result<Vec<ChangeLogEntry>>;

    /// Mark entries acknowledged (all, or those with `seq <= up_to_seq`).
    /// Returns the number of entries changed.
    async fn acknowledge_change_logs(&self, session_id: &str, up_to_seq: Option<i64>)
        -> Result<u64>;

    /// Delete acknowledged entries older than `older_than`
    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
