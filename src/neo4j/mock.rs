//! In-memory mock implementation of GraphStore for testing.
//!
//! Statements are interpreted clause by clause against a small property graph
//! held in `tokio::sync::RwLock` collections, with hooks for injecting
//! failures and latency. Conditionally compiled with `#[cfg(test)]`.

use crate::cypher::{Clause, Direction, NodePattern, PropertyValue, RelType, Statement};
use crate::neo4j::models::*;
use crate::neo4j::traits::GraphStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

// ============================================================================
// Property graph
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MemNode {
    pub label: &'static str,
    pub key: &'static str,
    pub props: BTreeMap<String, PropertyValue>,
}

impl MemNode {
    fn identity(&self) -> String {
        let value = self
            .props
            .get(self.key)
            .map(PropertyValue::to_cypher)
            .unwrap_or_default();
        format!("{}:{}", self.label, value)
    }

    pub fn get(&self, prop: &str) -> Option<&PropertyValue> {
        self.props.get(prop)
    }
}

/// Comparable view of a graph: node identities with their properties, and
/// edges rendered by node identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, BTreeMap<String, String>>,
    pub edges: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryGraph {
    next_id: u64,
    pub nodes: BTreeMap<u64, MemNode>,
    pub edges: BTreeSet<(u64, RelType, u64)>,
}

fn eval(value: &PropertyValue) -> PropertyValue {
    match value {
        PropertyValue::ServerNow => PropertyValue::DateTime(Utc::now()),
        other => other.clone(),
    }
}

impl MemoryGraph {
    fn find(&self, pattern: &NodePattern) -> Option<u64> {
        self.nodes
            .iter()
            .find(|(_, n)| n.label == pattern.label && n.props.get(pattern.key) == Some(&pattern.value))
            .map(|(id, _)| *id)
    }

    fn assign(&mut self, id: u64, assignments: &[crate::cypher::Assignment]) {
        if let Some(node) = self.nodes.get_mut(&id) {
            for a in assignments {
                match eval(&a.value) {
                    PropertyValue::Null => {
                        node.props.remove(a.property);
                    }
                    v => {
                        node.props.insert(a.property.to_string(), v);
                    }
                }
            }
        }
    }

    fn delete_node(&mut self, id: u64) {
        self.nodes.remove(&id);
        self.edges.retain(|(a, _, b)| *a != id && *b != id);
    }

    /// Apply a statement. A MATCH without a result ends the statement,
    /// keeping the effects of earlier clauses, the way Cypher does.
    pub fn apply(&mut self, st: &Statement) {
        let mut env: HashMap<&str, u64> = HashMap::new();

        for clause in &st.clauses {
            match clause {
                Clause::MergeNode {
                    var,
                    node,
                    on_create,
                    set,
                } => {
                    let id = match self.find(node) {
                        Some(id) => id,
                        None => {
                            let id = self.next_id;
                            self.next_id += 1;
                            let mut props = BTreeMap::new();
                            props.insert(node.key.to_string(), node.value.clone());
                            self.nodes.insert(
                                id,
                                MemNode {
                                    label: node.label,
                                    key: node.key,
                                    props,
                                },
                            );
                            self.assign(id, on_create);
                            id
                        }
                    };
                    self.assign(id, set);
                    env.insert(var.as_str(), id);
                }
                Clause::MatchNode { var, node } => match self.find(node) {
                    Some(id) => {
                        env.insert(var.as_str(), id);
                    }
                    None => return,
                },
                Clause::MergeEdge { from, rel, to } => {
                    if let (Some(a), Some(b)) = (env.get(from.as_str()), env.get(to.as_str())) {
                        self.edges.insert((*a, *rel, *b));
                    }
                }
                Clause::DetachEdges {
                    var,
                    rel,
                    direction,
                } => {
                    if let Some(id) = env.get(var.as_str()).copied() {
                        self.edges.retain(|(a, r, b)| {
                            let attached = match direction {
                                Direction::Outgoing => *a == id,
                                Direction::Incoming => *b == id,
                            };
                            !(attached && r == rel)
                        });
                    }
                }
                Clause::DeleteEdge { from, rel, to } => {
                    match (self.find(from), self.find(to)) {
                        (Some(a), Some(b)) => {
                            self.edges.remove(&(a, *rel, b));
                        }
                        _ => return,
                    }
                }
                Clause::DetachDelete { node } => match self.find(node) {
                    Some(id) => self.delete_node(id),
                    None => return,
                },
                Clause::UnionDetachDelete { labels, key, value } => {
                    let doomed: Vec<u64> = self
                        .nodes
                        .iter()
                        .filter(|(_, n)| labels.contains(&n.label) && n.props.get(*key) == Some(value))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in doomed {
                        self.delete_node(id);
                    }
                }
            }
        }
    }

    /// Look up a node by label and natural key value
    pub fn node(&self, label: &str, key_value: &str) -> Option<&MemNode> {
        let wanted = PropertyValue::Text(key_value.to_string());
        self.nodes
            .values()
            .find(|n| n.label == label && n.props.get(n.key) == Some(&wanted))
    }

    pub fn count(&self, label: &str) -> usize {
        self.nodes.values().filter(|n| n.label == label).count()
    }

    /// Whether `(from)-[rel]->(to)` exists, nodes given as (label, natural key)
    pub fn has_edge(&self, from: (&str, &str), rel: RelType, to: (&str, &str)) -> bool {
        let id_of = |(label, key): (&str, &str)| {
            let wanted = PropertyValue::Text(key.to_string());
            self.nodes
                .iter()
                .find(|(_, n)| n.label == label && n.props.get(n.key) == Some(&wanted))
                .map(|(id, _)| *id)
        };
        match (id_of(from), id_of(to)) {
            (Some(a), Some(b)) => self.edges.contains(&(a, rel, b)),
            _ => false,
        }
    }

    /// Snapshot ignoring the listed properties
    pub fn snapshot(&self, ignore: &[&str]) -> GraphSnapshot {
        let nodes = self
            .nodes
            .values()
            .map(|n| {
                let props = n
                    .props
                    .iter()
                    .filter(|(k, _)| !ignore.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.to_cypher()))
                    .collect();
                (n.identity(), props)
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .filter_map(|(a, rel, b)| {
                let a = self.nodes.get(a)?.identity();
                let b = self.nodes.get(b)?.identity();
                Some(format!("({})-[:{}]->({})", a, rel, b))
            })
            .collect();
        GraphSnapshot { nodes, edges }
    }
}

// ============================================================================
// Mock store
// ============================================================================

/// In-memory mock implementation of GraphStore for testing.
#[derive(Default)]
pub struct MockGraphStore {
    pub graph: RwLock<MemoryGraph>,
    /// Rendered Cypher of every statement executed, in order
    pub executed: RwLock<Vec<String>>,
    pub sessions: RwLock<HashMap<String, SessionNode>>,
    pub session_seq: RwLock<HashMap<String, i64>>,
    pub change_logs: RwLock<Vec<ChangeLogEntry>>,

    // Failure / latency injection
    pub fail_statements_containing: RwLock<Vec<String>>,
    pub fail_change_log_targets: RwLock<HashSet<String>>,
    pub slow_change_log_targets: RwLock<HashMap<String, Duration>>,
    pub heartbeat_delay: RwLock<Option<Duration>>,
    pub fail_next_probes: AtomicU32,
    pub fail_session_listing: AtomicBool,

    // Call counters
    pub probe_calls: AtomicU32,
    pub heartbeats: AtomicU32,
}

impl MockGraphStore {
    /// Create a new empty MockGraphStore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register sessions with `lastSeen = now`
    pub async fn with_sessions(self, ids: &[&str]) -> Self {
        for id in ids {
            let _ = self.register_session(id).await;
        }
        self
    }

    pub async fn set_last_seen(&self, session_id: &str, at: DateTime<Utc>) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.last_seen = at;
        }
    }

    pub async fn change_logs_for(&self, session_id: &str) -> Vec<ChangeLogEntry> {
        self.change_logs
            .read()
            .await
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Shift every entry's timestamp into the past
    pub async fn age_change_logs(&self, by: chrono::Duration) {
        for c in self.change_logs.write().await.iter_mut() {
            c.timestamp -= by;
        }
    }

    fn probe(entries: impl Iterator<Item = ChangeLogEntry>) -> ChangeProbe {
        let mut probe = ChangeProbe::default();
        for e in entries {
            probe.count += 1;
            probe.max_seq = probe.max_seq.max(e.seq);
        }
        probe
    }

    fn check_probe_failure(&self) -> Result<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let armed = self
            .fail_next_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    async fn execute_statement(&self, statement: &Statement) -> Result<()> {
        let cypher = statement.to_cypher();
        let failing = self
            .fail_statements_containing
            .read()
            .await
            .iter()
            .any(|needle| cypher.contains(needle.as_str()));
        self.executed.write().await.push(cypher.clone());
        if failing {
            return Err(anyhow!("Neo.ClientError.Statement.SyntaxError in: {}", cypher));
        }
        self.graph.write().await.apply(statement);
        Ok(())
    }

    async fn register_session(&self, session_id: &str) -> Result<()> {
        let now = Utc::now();
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .and_modify(|s| s.last_seen = now)
            .or_insert_with(|| SessionNode {
                session_id: session_id.to_string(),
                started_at: now,
                last_seen: now,
            });
        let logged = self
            .change_logs
            .read()
            .await
            .iter()
            .filter(|e| e.session_id == session_id)
            .filter_map(|e| e.seq)
            .max()
            .unwrap_or(0);
        let mut seqs = self.session_seq.write().await;
        let seq = seqs.entry(session_id.to_string()).or_insert(0);
        *seq = (*seq).max(logged);
        Ok(())
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let delay = *self.heartbeat_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        // the node and its counter go together
        self.sessions.write().await.remove(session_id);
        self.session_seq.write().await.remove(session_id);
        Ok(())
    }

    async fn list_active_sessions(&self, active_since: DateTime<Utc>) -> Result<Vec<SessionNode>> {
        if self.fail_session_listing.load(Ordering::SeqCst) {
            return Err(anyhow!("Session expired"));
        }
        let mut sessions: Vec<SessionNode> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.last_seen >= active_since)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn create_change_log(&self, entry: &ChangeLogEntry) -> Result<i64> {
        let delay = self
            .slow_change_log_targets
            .read()
            .await
            .get(&entry.session_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_change_log_targets
            .read()
            .await
            .contains(&entry.session_id)
        {
            return Err(anyhow!("write to {} failed", entry.session_id));
        }
        if !self.sessions.read().await.contains_key(&entry.session_id) {
            return Err(anyhow!("session {} is not registered", entry.session_id));
        }

        let seq = {
            let mut seqs = self.session_seq.write().await;
            let seq = seqs.entry(entry.session_id.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        let mut stored = entry.clone();
        stored.seq = Some(seq);
        self.change_logs.write().await.push(stored);
        Ok(seq)
    }

    async fn count_recent_unacknowledged(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ChangeProbe> {
        self.check_probe_failure()?;
        let logs = self.change_logs.read().await;
        Ok(Self::probe(logs.iter().cloned().filter(|c| {
            c.session_id == session_id && !c.acknowledged && c.timestamp > since
        })))
    }

    async fn probe_unacknowledged_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<ChangeProbe> {
        self.check_probe_failure()?;
        let logs = self.change_logs.read().await;
        Ok(Self::probe(logs.iter().cloned().filter(|c| {
            c.session_id == session_id && !c.acknowledged && c.seq.unwrap_or(0) > after_seq
        })))
    }

    async fn list_unacknowledged(&self, session_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let mut entries: Vec<ChangeLogEntry> = self
            .change_logs
            .read()
            .await
            .iter()
            .filter(|c| c.session_id == session_id && !c.acknowledged)
            .cloned()
            .collect();
        entries.sort_by_key(|c| c.seq);
        Ok(entries)
    }

    async fn acknowledge_change_logs(
        &self,
        session_id: &str,
        up_to_seq: Option<i64>,
    ) -> Result<u64> {
        let mut n = 0;
        for c in self.change_logs.write().await.iter_mut() {
            let in_range = match up_to_seq {
                Some(max) => c.seq.is_some_and(|s| s <= max),
                None => true,
            };
            if c.session_id == session_id && !c.acknowledged && in_range {
                c.acknowledged = true;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut logs = self.change_logs.write().await;
        let before = logs.len();
        logs.retain(|c| !(c.acknowledged && c.timestamp < older_than));
        Ok((before - logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypher::{Assignment, NodePattern};

    fn merge_wall(uid: &str, handle: i64) -> Statement {
        let mut st = Statement::new();
        st.push(Clause::MergeNode {
            var: "n".into(),
            node: NodePattern::new("Wall", "uid", uid),
            on_create: vec![],
            set: vec![Assignment::new("elementId", handle)],
        });
        st
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = MockGraphStore::new();
        store.execute_statement(&merge_wall("w1", 1)).await.unwrap();
        store.execute_statement(&merge_wall("w1", 1)).await.unwrap();
        assert_eq!(store.graph.read().await.count("Wall"), 1);
    }

    #[tokio::test]
    async fn test_failed_match_stops_statement() {
        let store = MockGraphStore::new();
        let mut st = Statement::new();
        st.push(Clause::MatchNode {
            var: "a".into(),
            node: NodePattern::new("Pipe", "uid", "missing"),
        });
        st.push(Clause::MergeNode {
            var: "n".into(),
            node: NodePattern::new("Wall", "uid", "w1"),
            on_create: vec![],
            set: vec![],
        });
        store.execute_statement(&st).await.unwrap();
        assert_eq!(store.graph.read().await.count("Wall"), 0);
    }

    #[tokio::test]
    async fn test_injected_statement_failure() {
        let store = MockGraphStore::new();
        store
            .fail_statements_containing
            .write()
            .await
            .push("bad".into());
        assert!(store.execute_statement(&merge_wall("bad", 1)).await.is_err());
        assert_eq!(store.executed.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_change_log_requires_registered_target() {
        let store = MockGraphStore::new().with_sessions(&["Y"]).await;
        let ok = ChangeLogEntry::new(1, ChangeOperation::Insert, "Y", "X");
        assert_eq!(store.create_change_log(&ok).await.unwrap(), 1);
        assert_eq!(store.create_change_log(&ok).await.unwrap(), 2);
        let missing = ChangeLogEntry::new(1, ChangeOperation::Insert, "Z", "X");
        assert!(store.create_change_log(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_seq_resumes_after_reregistration() {
        let store = MockGraphStore::new().with_sessions(&["Y"]).await;
        for h in 0..3 {
            let e = ChangeLogEntry::new(h, ChangeOperation::Modify, "Y", "X");
            store.create_change_log(&e).await.unwrap();
        }
        store.remove_session("Y").await.unwrap();
        assert!(store.session_seq.read().await.get("Y").is_none());

        store.register_session("Y").await.unwrap();
        let e = ChangeLogEntry::new(9, ChangeOperation::Insert, "Y", "X");
        assert_eq!(store.create_change_log(&e).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_acknowledge_up_to_seq() {
        let store = MockGraphStore::new().with_sessions(&["Y"]).await;
        for h in 0..3 {
            let e = ChangeLogEntry::new(h, ChangeOperation::Modify, "Y", "X");
            store.create_change_log(&e).await.unwrap();
        }
        assert_eq!(store.acknowledge_change_logs("Y", Some(2)).await.unwrap(), 2);
        let pending = store.list_unacknowledged("Y").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, Some(3));
    }
}
