//! Mutation entry point for the host application
//!
//! Local edits arrive as typed entities (or serialized attribute maps) and
//! leave as queued statements plus ChangeLog entries for the other sessions.

use super::feedback::{PullGuard, PullScope};
use super::propagator::{ChangeLogPropagator, PropagationReport};
use super::registry::SessionRegistry;
use crate::building::{ElementHandle, Entity, EntityRef, SerializedElement};
use crate::cypher::{Statement, UpsertTranslator};
use crate::neo4j::{ChangeLogEntry, ChangeOperation, GraphStore};
use crate::queue::CommandQueue;
use crate::spatial::SpatialIndex;
use crate::SyncContext;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What happened to one mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Dropped while a pull was in progress
    Suppressed,
    Applied {
        /// Statements handed to the dispatcher
        statements: usize,
        propagation: PropagationReport,
    },
}

/// Element diff reported by the host's periodic document comparison
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub created: Vec<SerializedElement>,
    pub modified: Vec<SerializedElement>,
    pub deleted: Vec<ElementHandle>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchReport {
    pub applied: usize,
    pub suppressed: usize,
    /// Elements that could not be decoded
    pub skipped: usize,
    pub statements: usize,
    pub propagation: PropagationReport,
}

impl BatchReport {
    fn add(&mut self, outcome: MutationOutcome) {
        match outcome {
            MutationOutcome::Suppressed => self.suppressed += 1,
            MutationOutcome::Applied {
                statements,
                propagation,
            } => {
                self.applied += 1;
                self.statements += statements;
                self.propagation.merge(propagation);
            }
        }
    }
}

/// What this session knows about the elements it has handled
#[derive(Debug, Default)]
struct LocalIndex {
    known: HashMap<ElementHandle, EntityRef>,
    spatial: SpatialIndex,
}

pub struct SyncCoordinator {
    session_id: String,
    translator: UpsertTranslator,
    queue: CommandQueue,
    propagator: ChangeLogPropagator,
    guard: PullGuard,
    store: Arc<dyn GraphStore>,
    index: Mutex<LocalIndex>,
}

impl SyncCoordinator {
    pub fn new(ctx: &SyncContext, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session_id: ctx.session_id.clone(),
            translator: UpsertTranslator::new(ctx.session_id.clone()),
            queue: ctx.queue.clone(),
            propagator: ChangeLogPropagator::new(
                registry,
                ctx.store.clone(),
                ctx.diagnostics.clone(),
                ctx.settings.propagation_timeout,
            ),
            guard: PullGuard::new(ctx.settings.suppressed_kinds.iter().copied()),
            store: ctx.store.clone(),
            index: Mutex::new(LocalIndex::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn enqueue(&self, statement: Statement) -> usize {
        if !statement.is_empty() && self.queue.enqueue(statement) {
            1
        } else {
            0
        }
    }

    /// Handle a created or modified entity. `Delete` is routed to
    /// [`notify_deletion`](Self::notify_deletion).
    pub async fn notify_mutation(
        &self,
        entity: &Entity,
        operation: ChangeOperation,
    ) -> MutationOutcome {
        let handle = entity.handle();
        if operation == ChangeOperation::Delete {
            return self.notify_deletion(handle).await;
        }
        let kind = entity.kind();

        // the index follows every mutation, suppressed or not
        let edge_changes = {
            let mut index = self.index.lock().await;
            index.known.insert(handle, entity.entity_ref());
            match entity.bounding_box() {
                Some(bbox) => index.spatial.update(kind, entity.natural_key(), bbox),
                None => Vec::new(),
            }
        };

        if self.guard.suppresses(kind) {
            debug!(element_id = handle, kind = %kind, %operation, "Mutation suppressed during pull");
            return MutationOutcome::Suppressed;
        }

        let mut statements = self.enqueue(self.translator.upsert(entity));
        for change in &edge_changes {
            statements += self.enqueue(self.translator.relate(change));
        }

        debug!(
            element_id = handle,
            kind = %kind,
            %operation,
            statements,
            edge_changes = edge_changes.len(),
            "Mutation queued"
        );

        let propagation = self.propagator.propagate(handle, operation).await;
        MutationOutcome::Applied {
            statements,
            propagation,
        }
    }

    /// Handle a deleted element. The entity itself is gone, so only what
    /// this session remembers about the handle is available.
    pub async fn notify_deletion(&self, handle: ElementHandle) -> MutationOutcome {
        let known = {
            let mut index = self.index.lock().await;
            let known = index.known.remove(&handle);
            if let Some(r) = &known {
                index.spatial.remove(r.kind, &r.natural_key);
            }
            known
        };

        if self.guard.is_active() {
            debug!(element_id = handle, "Deletion suppressed during pull");
            return MutationOutcome::Suppressed;
        }

        if known.is_none() {
            debug!(element_id = handle, "Deleting unknown handle across all handle-keyed labels");
        }
        let statements = self.enqueue(self.translator.remove(handle, known.as_ref()));
        let propagation = self
            .propagator
            .propagate(handle, ChangeOperation::Delete)
            .await;
        MutationOutcome::Applied {
            statements,
            propagation,
        }
    }

    pub fn set_pull_in_progress(&self, in_progress: bool) {
        self.guard.set(in_progress);
    }

    pub fn is_pull_in_progress(&self) -> bool {
        self.guard.is_active()
    }

    /// Suppress feedback until the returned scope is dropped
    pub fn begin_pull(&self) -> PullScope {
        self.guard.begin()
    }

    /// Apply a serialized element diff. Elements that fail to decode are
    /// logged and skipped; the rest of the batch still goes through.
    pub async fn apply_batch(&self, batch: &ChangeBatch) -> BatchReport {
        let mut report = BatchReport::default();

        let upserts = batch
            .created
            .iter()
            .map(|el| (el, ChangeOperation::Insert))
            .chain(batch.modified.iter().map(|el| (el, ChangeOperation::Modify)));

        for (element, operation) in upserts {
            match Entity::from_serialized(element) {
                Ok(entity) => report.add(self.notify_mutation(&entity, operation).await),
                Err(e) => {
                    warn!(
                        element_id = element.handle,
                        kind = %element.kind,
                        %operation,
                        "Skipping element: {}",
                        e
                    );
                    report.skipped += 1;
                }
            }
        }

        for handle in &batch.deleted {
            report.add(self.notify_deletion(*handle).await);
        }

        report
    }

    /// Acknowledge entries addressed to this session (all, or up to a seq)
    pub async fn acknowledge(&self, up_to_seq: Option<i64>) -> Result<u64> {
        let n = self
            .store
            .acknowledge_change_logs(&self.session_id, up_to_seq)
            .await
            .context("Failed to acknowledge ChangeLog entries")?;
        debug!(session_id = %self.session_id, acknowledged = n, ?up_to_seq, "ChangeLog acknowledged");
        Ok(n)
    }

    /// Unacknowledged entries addressed to this session, oldest first
    pub async fn pending_changes(&self) -> Result<Vec<ChangeLogEntry>> {
        self.store
            .list_unacknowledged(&self.session_id)
            .await
            .context("Failed to list pending ChangeLog entries")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::{EntityKind, Point3};
    use crate::cypher::translator::fixtures::*;
    use crate::diagnostics::DiagnosticLog;
    use crate::neo4j::mock::MockGraphStore;
    use crate::queue::QueueReceiver;
    use crate::SyncSettings;

    async fn coordinator(
        me: &str,
        sessions: &[&str],
    ) -> (SyncCoordinator, QueueReceiver, Arc<MockGraphStore>) {
        let store = Arc::new(MockGraphStore::new().with_sessions(sessions).await);
        let (ctx, rx) = SyncContext::new(
            me,
            store.clone(),
            SyncSettings::default(),
            Arc::new(DiagnosticLog::disabled()),
        );
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            me,
            ctx.settings.session_ttl,
        ));
        (SyncCoordinator::new(&ctx, registry), rx, store)
    }

    fn p(x: f64, y: f64, z: f64) -> Point3 {
        Point3::new(x, y, z)
    }

    fn crossing_pipe() -> Entity {
        pipe(900, "pipe-900", p(2.0, -1.0, 1.0), p(2.0, 1.0, 1.0))
    }

    fn straight_wall() -> Entity {
        wall(501, "w-501", p(0.0, 0.0, 0.0), p(4.0, 0.0, 0.0))
    }

    #[tokio::test]
    async fn test_mutation_queues_upsert_and_propagates() {
        let (c, mut rx, store) = coordinator("X", &["X", "Y"]).await;

        let outcome = c
            .notify_mutation(&straight_wall(), ChangeOperation::Insert)
            .await;
        let MutationOutcome::Applied {
            statements,
            propagation,
        } = outcome
        else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(statements, 1);
        assert_eq!(propagation.succeeded, 1);

        let queued = rx.drain_now();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].to_cypher().starts_with("MERGE (n:Wall {uid: 'w-501'})"));

        let logs = store.change_logs_for("Y").await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].target_element_id, 501);
        assert_eq!(logs[0].operation, ChangeOperation::Insert);
    }

    #[tokio::test]
    async fn test_solitary_session_queues_but_creates_no_entries() {
        let (c, mut rx, store) = coordinator("X", &["X"]).await;
        let outcome = c
            .notify_mutation(&straight_wall(), ChangeOperation::Modify)
            .await;
        assert_eq!(
            outcome,
            MutationOutcome::Applied {
                statements: 1,
                propagation: PropagationReport::default()
            }
        );
        assert_eq!(rx.drain_now().len(), 1);
        assert!(store.change_logs.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_crossing_wall_queues_intersects_edge() {
        let (c, mut rx, _store) = coordinator("X", &["X"]).await;
        c.notify_mutation(&straight_wall(), ChangeOperation::Insert)
            .await;
        let outcome = c
            .notify_mutation(&crossing_pipe(), ChangeOperation::Insert)
            .await;
        assert!(matches!(
            outcome,
            MutationOutcome::Applied { statements: 2, .. }
        ));

        let queued = rx.drain_now();
        let edge = queued.last().unwrap().to_cypher();
        assert!(edge.contains("MERGE (a)-[:INTERSECTS]->(b)"), "{}", edge);
        assert!(edge.contains("(a:Pipe {uid: 'pipe-900'})"));
        assert!(edge.contains("(b:Wall {uid: 'w-501'})"));
    }

    #[tokio::test]
    async fn test_suppressed_kind_during_pull() {
        let (c, mut rx, store) = coordinator("X", &["X", "Y"]).await;

        {
            let _pull = c.begin_pull();
            assert!(c.is_pull_in_progress());
            assert_eq!(
                c.notify_mutation(&crossing_pipe(), ChangeOperation::Insert)
                    .await,
                MutationOutcome::Suppressed
            );
            assert_eq!(c.notify_deletion(33).await, MutationOutcome::Suppressed);
        }
        assert!(!c.is_pull_in_progress());
        assert!(rx.drain_now().is_empty());
        assert!(store.change_logs.read().await.is_empty());

        // the suppressed pipe is still known to the spatial index
        let outcome = c
            .notify_mutation(&straight_wall(), ChangeOperation::Insert)
            .await;
        assert!(matches!(
            outcome,
            MutationOutcome::Applied { statements: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unsuppressed_kind_during_pull_is_applied() {
        let (c, mut rx, _store) = coordinator("X", &["X"]).await;
        c.set_pull_in_progress(true);
        let outcome = c
            .notify_mutation(&straight_wall(), ChangeOperation::Modify)
            .await;
        c.set_pull_in_progress(false);
        assert!(matches!(outcome, MutationOutcome::Applied { .. }));
        assert_eq!(rx.drain_now().len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_of_known_entity_is_type_exact() {
        let (c, mut rx, store) = coordinator("X", &["X", "Y"]).await;
        c.notify_mutation(&straight_wall(), ChangeOperation::Insert)
            .await;
        rx.drain_now();

        c.notify_mutation(&straight_wall(), ChangeOperation::Delete)
            .await;
        let queued = rx.drain_now();
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].to_cypher(),
            "MATCH (n:Wall {uid: 'w-501'}) DETACH DELETE n"
        );
        let logs = store.change_logs_for("Y").await;
        assert_eq!(logs.last().unwrap().operation, ChangeOperation::Delete);
    }

    #[tokio::test]
    async fn test_deletion_of_unknown_handle_matches_every_label() {
        let (c, mut rx, _store) = coordinator("X", &["X"]).await;
        c.notify_deletion(77).await;
        let cypher = rx.drain_now()[0].to_cypher();
        assert!(cypher.starts_with("MATCH (n) WHERE n.elementId = 77 AND ("));
        for kind in EntityKind::HANDLE_KEYED {
            assert!(cypher.contains(&format!("n:{}", kind.label())));
        }
        assert!(!cypher.contains("n:Level"));
    }

    #[tokio::test]
    async fn test_apply_batch_skips_undecodable_elements() {
        let (c, mut rx, _store) = coordinator("X", &["X"]).await;
        let good = SerializedElement::new(EntityKind::Pipe, 900)
            .with("uid", "pipe-900")
            .with("x1", 0.0)
            .with("y1", 0.0)
            .with("z1", 1.0)
            .with("x2", 5.0)
            .with("y2", 0.0)
            .with("z2", 1.0)
            .with("diameter", 0.1);
        let missing_end = SerializedElement::new(EntityKind::Pipe, 901)
            .with("uid", "pipe-901")
            .with("x1", 0.0)
            .with("y1", 0.0)
            .with("z1", 1.0);
        let batch = ChangeBatch {
            created: vec![good],
            modified: vec![missing_end],
            deleted: vec![77],
        };

        let report = c.apply_batch(&batch).await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.statements, 2);
        assert_eq!(rx.drain_now().len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_and_pending() {
        let (c, _rx, store) = coordinator("X", &["X", "Y"]).await;
        for h in [1, 2, 3] {
            let e = ChangeLogEntry::new(h, ChangeOperation::Modify, "X", "Y");
            store.create_change_log(&e).await.unwrap();
        }

        let pending = c.pending_changes().await.unwrap();
        assert_eq!(
            pending.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert_eq!(c.acknowledge(Some(2)).await.unwrap(), 2);
        assert_eq!(c.pending_changes().await.unwrap().len(), 1);
        assert_eq!(c.acknowledge(None).await.unwrap(), 1);
        assert!(c.pending_changes().await.unwrap().is_empty());
    }
}
