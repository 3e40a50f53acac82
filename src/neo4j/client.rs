//! Neo4j client for the shared building graph

use super::models::*;
use crate::cypher::Statement;
use crate::Neo4jSettings;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use neo4rs::{query, ConfigBuilder, Graph, Query};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Client for Neo4j operations
pub struct Neo4jClient {
    graph: Arc<Graph>,
    query_timeout: Duration,
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

impl Neo4jClient {
    /// Connect and make sure the schema exists
    pub async fn new(settings: &Neo4jSettings) -> Result<Self> {
        let config = ConfigBuilder::default()
            .uri(settings.uri.as_str())
            .user(settings.user.as_str())
            .password(settings.password.as_str())
            .max_connections(settings.max_connections)
            .fetch_size(settings.fetch_size)
            .build()
            .context("Invalid Neo4j configuration")?;

        let graph = Graph::connect(config)
            .await
            .context("Failed to connect to Neo4j")?;

        let client = Self {
            graph: Arc::new(graph),
            query_timeout: settings.query_timeout,
        };

        client.init_schema().await?;

        Ok(client)
    }

    /// Initialize the graph schema with constraints and indexes
    async fn init_schema(&self) -> Result<()> {
        let constraints = vec![
            // Natural keys: one node per key across every session
            "CREATE CONSTRAINT building_name IF NOT EXISTS FOR (b:Building) REQUIRE b.name IS UNIQUE",
            "CREATE CONSTRAINT level_name IF NOT EXISTS FOR (l:Level) REQUIRE l.name IS UNIQUE",
            "CREATE CONSTRAINT room_uid IF NOT EXISTS FOR (r:Room) REQUIRE r.uid IS UNIQUE",
            "CREATE CONSTRAINT wall_uid IF NOT EXISTS FOR (w:Wall) REQUIRE w.uid IS UNIQUE",
            "CREATE CONSTRAINT door_uid IF NOT EXISTS FOR (d:Door) REQUIRE d.uid IS UNIQUE",
            "CREATE CONSTRAINT stair_uid IF NOT EXISTS FOR (s:Stair) REQUIRE s.uid IS UNIQUE",
            "CREATE CONSTRAINT pipe_uid IF NOT EXISTS FOR (p:Pipe) REQUIRE p.uid IS UNIQUE",
            "CREATE CONSTRAINT prov_space_uid IF NOT EXISTS FOR (p:ProvisionalSpace) REQUIRE p.uid IS UNIQUE",
            // Sync bookkeeping
            "CREATE CONSTRAINT change_log_id IF NOT EXISTS FOR (c:ChangeLog) REQUIRE c.id IS UNIQUE",
            "CREATE CONSTRAINT session_id IF NOT EXISTS FOR (s:Session) REQUIRE s.sessionId IS UNIQUE",
        ];

        let indexes = vec![
            "CREATE INDEX change_log_session IF NOT EXISTS FOR (c:ChangeLog) ON (c.sessionId, c.acknowledged)",
            "CREATE INDEX change_log_seq IF NOT EXISTS FOR (c:ChangeLog) ON (c.seq)",
            "CREATE INDEX change_log_timestamp IF NOT EXISTS FOR (c:ChangeLog) ON (c.timestamp)",
            "CREATE INDEX session_last_seen IF NOT EXISTS FOR (s:Session) ON (s.lastSeen)",
            "CREATE INDEX room_element IF NOT EXISTS FOR (r:Room) ON (r.elementId)",
            "CREATE INDEX wall_element IF NOT EXISTS FOR (w:Wall) ON (w.elementId)",
            "CREATE INDEX door_element IF NOT EXISTS FOR (d:Door) ON (d.elementId)",
            "CREATE INDEX stair_element IF NOT EXISTS FOR (s:Stair) ON (s.elementId)",
            "CREATE INDEX pipe_element IF NOT EXISTS FOR (p:Pipe) ON (p.elementId)",
            "CREATE INDEX prov_space_element IF NOT EXISTS FOR (p:ProvisionalSpace) ON (p.elementId)",
        ];

        for constraint in constraints {
            if let Err(e) = self.graph.run(query(constraint)).await {
                tracing::warn!("Constraint may already exist: {}", e);
            }
        }

        for index in indexes {
            if let Err(e) = self.graph.run(query(index)).await {
                tracing::warn!("Index may already exist: {}", e);
            }
        }

        Ok(())
    }

    /// Bound any graph call by the configured query timeout
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!(
                "{} timed out after {:?}",
                what,
                self.query_timeout
            )),
        }
    }

    /// Execute a parameterized Cypher query (internal use only)
    pub(crate) async fn execute_with_params(&self, q: Query) -> Result<Vec<neo4rs::Row>> {
        self.bounded("query", async {
            let mut result = self.graph.execute(q).await?;
            let mut rows = Vec::new();
            while let Some(row) = result.next().await? {
                rows.push(row);
            }
            Ok(rows)
        })
        .await
    }

    /// Run a write-only query, discarding results
    async fn run(&self, what: &str, q: Query) -> Result<()> {
        self.bounded(what, async {
            self.graph.run(q).await?;
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Building graph
    // ========================================================================

    /// Execute a generated statement
    pub async fn execute_statement(&self, statement: &Statement) -> Result<()> {
        let cypher = statement.to_cypher();
        self.run("statement", query(&cypher)).await
    }

    // ========================================================================
    // Session registry
    // ========================================================================

    /// Register or refresh a session. A re-created node resumes `changeSeq`
    /// above every entry still logged for it, so seq never goes backwards.
    pub async fn register_session(&self, session_id: &str) -> Result<()> {
        let q = query(
            r#"
            MERGE (s:Session {sessionId: $id})
            ON CREATE SET s.startedAt = datetime($now), s.changeSeq = 0
            SET s.lastSeen = datetime($now)
            WITH s
            OPTIONAL MATCH (c:ChangeLog {sessionId: $id})
            WITH s, max(c.seq) AS logged
            SET s.changeSeq = CASE
                WHEN logged IS NOT NULL AND logged > coalesce(s.changeSeq, 0) THEN logged
                ELSE coalesce(s.changeSeq, 0)
            END
            "#,
        )
        .param("id", session_id)
        .param("now", ts(&Utc::now()));

        self.run("register session", q)
            .await
            .with_context(|| format!("Failed to register session {}", session_id))
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        let q = query("MATCH (s:Session {sessionId: $id}) SET s.lastSeen = datetime($now)")
            .param("id", session_id)
            .param("now", ts(&Utc::now()));
        self.run("session heartbeat", q).await
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        let q = query("MATCH (s:Session {sessionId: $id}) DETACH DELETE s").param("id", session_id);
        self.run("remove session", q).await
    }

    pub async fn list_active_sessions(
        &self,
        active_since: DateTime<Utc>,
    ) -> Result<Vec<SessionNode>> {
        let q = query(
            r#"
            MATCH (s:Session)
            WHERE s.lastSeen >= datetime($since)
            RETURN s.sessionId AS sessionId,
                   toString(s.startedAt) AS startedAt,
                   toString(s.lastSeen) AS lastSeen
            ORDER BY s.sessionId
            "#,
        )
        .param("since", ts(&active_since));

        let rows = self.execute_with_params(q).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(SessionNode {
                session_id: row.get("sessionId")?,
                started_at: parse_ts(&row.get::<String>("startedAt")?)?,
                last_seen: parse_ts(&row.get::<String>("lastSeen")?)?,
            });
        }
        Ok(sessions)
    }

    // ========================================================================
    // ChangeLog
    // ========================================================================

    /// Create an entry; the sequence number is taken from the target session
    /// node in the same transaction, so entries for a vanished session fail.
    pub async fn create_change_log(&self, entry: &ChangeLogEntry) -> Result<i64> {
        let q = query(
            r#"
            MATCH (s:Session {sessionId: $session_id})
            SET s.changeSeq = coalesce(s.changeSeq, 0) + 1
            CREATE (c:ChangeLog {
                id: $id,
                targetElementId: $target,
                operation: $operation,
                sessionId: $session_id,
                sourceSessionId: $source,
                acknowledged: false,
                timestamp: datetime($timestamp),
                seq: s.changeSeq
            })
            RETURN c.seq AS seq
            "#,
        )
        .param("id", entry.id.to_string())
        .param("target", entry.target_element_id)
        .param("operation", entry.operation.to_string())
        .param("session_id", entry.session_id.as_str())
        .param("source", entry.source_session_id.as_str())
        .param("timestamp", ts(&entry.timestamp));

        let rows = self.execute_with_params(q).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("session {} is not registered", entry.session_id))?;
        Ok(row.get("seq")?)
    }

    fn probe_from_row(row: Option<&neo4rs::Row>) -> Result<ChangeProbe> {
        let Some(row) = row else {
            return Ok(ChangeProbe::default());
        };
        let count: i64 = row.get("changeCount")?;
        let max_seq: i64 = row.get("maxSeq")?;
        Ok(ChangeProbe {
            count: count.max(0) as u64,
            max_seq: (max_seq >= 0).then_some(max_seq),
        })
    }

    pub async fn count_recent_unacknowledged(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ChangeProbe> {
        let q = query(
            r#"
            MATCH (c:ChangeLog)
            WHERE c.sessionId = $s AND c.acknowledged = false
              AND c.timestamp > datetime($threshold)
            RETURN count(c) AS changeCount, coalesce(max(c.seq), -1) AS maxSeq
            "#,
        )
        .param("s", session_id)
        .param("threshold", ts(&since));

        let rows = self.execute_with_params(q).await?;
        Self::probe_from_row(rows.first())
    }

    pub async fn probe_unacknowledged_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<ChangeProbe> {
        let q = query(
            r#"
            MATCH (c:ChangeLog)
            WHERE c.sessionId = $s AND c.acknowledged = false AND c.seq > $after
            RETURN count(c) AS changeCount, coalesce(max(c.seq), -1) AS maxSeq
            "#,
        )
        .param("s", session_id)
        .param("after", after_seq);

        let rows = self.execute_with_params(q).await?;
        Self::probe_from_row(rows.first())
    }

    pub async fn list_unacknowledged(&self, session_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let q = query(
            r#"
            MATCH (c:ChangeLog)
            WHERE c.sessionId = $s AND c.acknowledged = false
            RETURN c.id AS id, c.targetElementId AS target, c.operation AS operation,
                   c.sessionId AS sessionId, c.sourceSessionId AS source,
                   toString(c.timestamp) AS timestamp, c.seq AS seq
            ORDER BY c.seq
            "#,
        )
        .param("s", session_id);

        let rows = self.execute_with_params(q).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let operation: String = row.get("operation")?;
            entries.push(ChangeLogEntry {
                id: row.get::<String>("id")?.parse()?,
                target_element_id: row.get("target")?,
                operation: operation.parse().map_err(|e: String| anyhow!(e))?,
                session_id: row.get("sessionId")?,
                source_session_id: row.get::<String>("source").unwrap_or_default(),
                acknowledged: false,
                timestamp: parse_ts(&row.get::<String>("timestamp")?)?,
                seq: row.get::<i64>("seq").ok(),
            });
        }
        Ok(entries)
    }

    pub async fn acknowledge_change_logs(
        &self,
        session_id: &str,
        up_to_seq: Option<i64>,
    ) -> Result<u64> {
        let q = match up_to_seq {
            Some(seq) => query(
                r#"
                MATCH (c:ChangeLog)
                WHERE c.sessionId = $s AND c.acknowledged = false AND c.seq <= $seq
                SET c.acknowledged = true
                RETURN count(c) AS n
                "#,
            )
            .param("s", session_id)
            .param("seq", seq),
            None => query(
                r#"
                MATCH (c:ChangeLog)
                WHERE c.sessionId = $s AND c.acknowledged = false
                SET c.acknowledged = true
                RETURN count(c) AS n
                "#,
            )
            .param("s", session_id),
        };

        let rows = self.execute_with_params(q).await?;
        let n: i64 = match rows.first() {
            Some(row) => row.get("n")?,
            None => 0,
        };
        Ok(n.max(0) as u64)
    }

    pub async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let q = query(
            r#"
            MATCH (c:ChangeLog)
            WHERE c.acknowledged = true AND c.timestamp < datetime($before)
            WITH c LIMIT 10000
            DETACH DELETE c
            RETURN count(*) AS n
            "#,
        )
        .param("before", ts(&older_than));

        let rows = self.execute_with_params(q).await?;
        let n: i64 = match rows.first() {
            Some(row) => row.get("n")?,
            None => 0,
        };
        Ok(n.max(0) as u64)
    }
}
