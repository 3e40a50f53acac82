//! Multi-session synchronization
//!
//! [`SyncService`] wires one session together: it registers the session,
//! spawns the dispatcher and the change listener, and exposes the
//! [`SyncCoordinator`] the host reports its edits to.

pub mod coordinator;
pub mod feedback;
pub mod listener;
pub mod propagator;
pub mod registry;

pub use coordinator::{BatchReport, ChangeBatch, MutationOutcome, SyncCoordinator};
pub use feedback::{PullGuard, PullScope};
pub use listener::{ChangeListener, ListenerState};
pub use propagator::{ChangeLogPropagator, PropagationReport};
pub use registry::SessionRegistry;

use crate::events::SyncEvent;
use crate::queue::{Dispatcher, QueueCounts, QueueReceiver};
use crate::SyncContext;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// `now - age`, clamped to the earliest representable instant
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A running session
pub struct SyncService {
    ctx: SyncContext,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    listener: ChangeListener,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncService {
    /// Register the session and start its background tasks
    pub async fn start(ctx: SyncContext, receiver: QueueReceiver) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(
            ctx.store.clone(),
            ctx.session_id.clone(),
            ctx.settings.session_ttl,
        ));
        registry.register().await?;

        let dispatcher = Dispatcher::spawn(receiver, ctx.store.clone());
        let coordinator = Arc::new(SyncCoordinator::new(&ctx, registry.clone()));
        let listener = ChangeListener::start(&ctx, registry.clone());

        info!(session_id = %ctx.session_id, "Sync service started");
        Ok(Self {
            ctx,
            registry,
            dispatcher,
            listener,
            coordinator,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        self.coordinator.clone()
    }

    pub fn listener(&self) -> &ChangeListener {
        &self.listener
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Receive pull requests raised by the listener
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.dispatcher.counts()
    }

    /// Stop the listener, drain the queue, and deregister the session
    pub async fn shutdown(self) -> QueueCounts {
        self.listener.dispose().await;
        let counts = self
            .dispatcher
            .shutdown(self.ctx.settings.drain_timeout)
            .await;
        if let Err(e) = self.registry.deregister().await {
            warn!(session_id = %self.ctx.session_id, "{:#}", e);
            self.ctx
                .diagnostics
                .record(&self.ctx.session_id, "shutdown: deregister", &e);
        }
        info!(session_id = %self.ctx.session_id, "Sync service stopped");
        counts
    }
}
