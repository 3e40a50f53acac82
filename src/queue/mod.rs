//! Command queue and single-consumer dispatcher
//!
//! ## Design
//!
//! Uses an unbounded mpsc channel + one background task:
//! 1. `enqueue(statement)` never blocks and may be called from any task
//! 2. The dispatcher drains statements in FIFO order and executes them one
//!    at a time against the `GraphStore`
//! 3. A failing statement is logged with its full Cypher and skipped
//! 4. On shutdown the dispatcher finishes what is already queued, then exits
//!
//! Order is only guaranteed between statements enqueued by the same caller;
//! concurrent producers interleave.

use crate::cypher::Statement;
use crate::neo4j::GraphStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub enqueued: u64,
    pub executed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Statements accepted but not yet executed or failed
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.executed + self.failed)
    }
}

impl QueueStats {
    fn counts(&self) -> QueueCounts {
        QueueCounts {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            executed: self.executed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Statement>,
    stats: Arc<QueueStats>,
}

/// Consumer side, handed to [`Dispatcher::spawn`]
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Statement>,
    stats: Arc<QueueStats>,
}

impl CommandQueue {
    pub fn new() -> (CommandQueue, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        (
            CommandQueue {
                tx,
                stats: stats.clone(),
            },
            QueueReceiver { rx, stats },
        )
    }

    /// Queue a statement for execution.
    ///
    /// Returns false when the dispatcher is gone and the statement was dropped.
    pub fn enqueue(&self, statement: Statement) -> bool {
        if statement.is_empty() {
            return true;
        }
        match self.tx.send(statement) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(mpsc::error::SendError(statement)) => {
                warn!(
                    statement = %statement,
                    "Dispatcher stopped, statement dropped"
                );
                false
            }
        }
    }

    pub fn counts(&self) -> QueueCounts {
        self.stats.counts()
    }
}

impl QueueReceiver {
    /// Take everything currently queued without executing it
    #[cfg(test)]
    pub fn drain_now(&mut self) -> Vec<Statement> {
        let mut out = Vec::new();
        while let Ok(st) = self.rx.try_recv() {
            out.push(st);
        }
        out
    }
}

/// Background task executing queued statements in order
pub struct Dispatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<QueueStats>,
}

impl Dispatcher {
    /// Spawn the dispatcher on the current runtime
    pub fn spawn(receiver: QueueReceiver, store: Arc<dyn GraphStore>) -> Self {
        let cancel = CancellationToken::new();
        let stats = receiver.stats.clone();
        let handle = tokio::spawn(Self::run_loop(receiver, store, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
            stats,
        }
    }

    pub fn counts(&self) -> QueueCounts {
        self.stats.counts()
    }

    async fn run_loop(
        mut receiver: QueueReceiver,
        store: Arc<dyn GraphStore>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                next = receiver.rx.recv() => match next {
                    Some(statement) => {
                        Self::execute(&*store, &receiver.stats, statement).await;
                    }
                    None => break, // every producer dropped
                },
                _ = cancel.cancelled() => {
                    receiver.rx.close();
                    while let Some(statement) = receiver.rx.recv().await {
                        Self::execute(&*store, &receiver.stats, statement).await;
                    }
                    break;
                }
            }
        }
        debug!("Dispatcher loop finished");
    }

    async fn execute(store: &dyn GraphStore, stats: &QueueStats, statement: Statement) {
        match store.execute_statement(&statement).await {
            Ok(()) => {
                stats.executed.fetch_add(1, Ordering::SeqCst);
                debug!(statement = %statement, "Statement executed");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    statement = %statement,
                    error = %e,
                    "Statement failed, skipping"
                );
            }
        }
    }

    /// Stop accepting work, finish what is queued, and wait up to `grace`
    pub async fn shutdown(mut self, grace: Duration) -> QueueCounts {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Dispatcher task ended abnormally: {}", e),
                Err(_) => warn!("Dispatcher did not drain within {:?}, abandoning", grace),
            }
        }
        let counts = self.stats.counts();
        info!(
            executed = counts.executed,
            failed = counts.failed,
            pending = counts.pending(),
            "Dispatcher stopped"
        );
        counts
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
