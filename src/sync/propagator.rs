//! Change-log fan-out
//!
//! Every local mutation leaves one `(:ChangeLog)` entry per other live
//! session. Creations run concurrently, each in its own task, and the caller
//! waits at most `timeout` for them. Creations still running at the deadline
//! are left to finish on their own.

use super::registry::SessionRegistry;
use crate::building::ElementHandle;
use crate::diagnostics::DiagnosticLog;
use crate::neo4j::{ChangeLogEntry, ChangeOperation, GraphStore};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Outcome of one fan-out. A timeout is partial success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PropagationReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Creations still running when the wait ended
    pub timed_out: usize,
}

impl PropagationReport {
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.attempted
    }

    pub fn merge(&mut self, other: PropagationReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
    }
}

pub struct ChangeLogPropagator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn GraphStore>,
    diagnostics: Arc<DiagnosticLog>,
    timeout: Duration,
}

impl ChangeLogPropagator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn GraphStore>,
        diagnostics: Arc<DiagnosticLog>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            diagnostics,
            timeout,
        }
    }

    /// Create one ChangeLog entry for every other active session
    pub async fn propagate(
        &self,
        handle: ElementHandle,
        operation: ChangeOperation,
    ) -> PropagationReport {
        let source = self.registry.session_id().to_string();

        let targets = match self.registry.propagation_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(
                    session_id = %source,
                    element_id = handle,
                    "Could not read session registry, change not propagated: {:#}",
                    e
                );
                self.diagnostics.record(&source, "propagate: registry", &e);
                return PropagationReport::default();
            }
        };

        if targets.is_empty() {
            debug!(element_id = handle, "No other sessions, nothing to propagate");
            return PropagationReport::default();
        }

        let deadline = Instant::now() + self.timeout;
        let mut report = PropagationReport {
            attempted: targets.len(),
            ..Default::default()
        };

        let mut pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|target| {
                let store = self.store.clone();
                let diagnostics = self.diagnostics.clone();
                let entry = ChangeLogEntry::new(handle, operation, target, source.clone());
                tokio::spawn(async move {
                    match store.create_change_log(&entry).await {
                        Ok(seq) => {
                            debug!(
                                target_session = %entry.session_id,
                                element_id = entry.target_element_id,
                                operation = %entry.operation,
                                seq,
                                "ChangeLog created"
                            );
                            true
                        }
                        Err(e) => {
                            error!(
                                target_session = %entry.session_id,
                                element_id = entry.target_element_id,
                                operation = %entry.operation,
                                "ChangeLog creation failed: {:#}",
                                e
                            );
                            diagnostics.record(
                                &entry.source_session_id,
                                &format!("propagate: ChangeLog for {}", entry.session_id),
                                &e,
                            );
                            false
                        }
                    }
                })
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok(true))) => report.succeeded += 1,
                Ok(Some(Ok(false))) => report.failed += 1,
                Ok(Some(Err(join_err))) => {
                    error!("ChangeLog task crashed: {}", join_err);
                    self.diagnostics.record_text(
                        &source,
                        "propagate: task crashed",
                        &join_err.to_string(),
                    );
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    // dropping the JoinHandles detaches the remaining tasks
                    report.timed_out = pending.len();
                    warn!(
                        element_id = handle,
                        outstanding = report.timed_out,
                        "ChangeLog fan-out exceeded {:?}, continuing in background",
                        self.timeout
                    );
                    self.diagnostics.record_text(
                        &source,
                        "propagate: timeout",
                        &format!(
                            "element {} {}: {} of {} creations outstanding after {:?}",
                            handle, operation, report.timed_out, report.attempted, self.timeout
                        ),
                    );
                    break;
                }
            }
        }

        report
    }
}
