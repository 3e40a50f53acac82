//! Change notification listener
//!
//! Neo4j offers no change stream to a Bolt client, so each session polls for
//! ChangeLog entries addressed to it. The loop alternates between sleeping
//! (`Idle`) and probing (`Polling`); every probe that observes a positive
//! count raises one [`SyncEvent::PullRequested`]. The external pull logic
//! decides what to do with it and acknowledges the entries it consumed.
//!
//! Two detection strategies are available:
//! - [`DetectionMode::Cursor`]: entries with a `seq` above the last one
//!   signalled. Slow-to-acknowledge entries are never missed and an entry is
//!   signalled once.
//! - [`DetectionMode::RecencyWindow`]: entries younger than the window. An
//!   entry that sits unacknowledged past the window is no longer signalled.

use super::cutoff;
use super::registry::SessionRegistry;
use crate::diagnostics::DiagnosticLog;
use crate::events::{EventBus, EventEmitter, SyncEvent};
use crate::neo4j::GraphStore;
use crate::{DetectionMode, SyncContext};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Idle = 0,
    Polling = 1,
    Disposing = 2,
    Stopped = 3,
}

impl ListenerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ListenerState::Idle,
            1 => ListenerState::Polling,
            2 => ListenerState::Disposing,
            _ => ListenerState::Stopped,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    polls: AtomicU64,
    detections: AtomicU64,
}

impl Shared {
    fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move between Idle and Polling; Disposing and Stopped are sticky
    fn enter(&self, next: ListenerState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                match ListenerState::from_u8(cur) {
                    ListenerState::Disposing | ListenerState::Stopped => None,
                    _ => Some(next as u8),
                }
            });
    }

    fn force(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Probe strategy, owned by the polling task
#[derive(Debug)]
enum Detector {
    Cursor { last_seen: i64 },
    RecencyWindow { window: Duration },
}

impl Detector {
    fn new(mode: DetectionMode, window: Duration) -> Self {
        match mode {
            DetectionMode::Cursor => Detector::Cursor { last_seen: 0 },
            DetectionMode::RecencyWindow => Detector::RecencyWindow { window },
        }
    }

    /// Number of entries worth signalling right now
    async fn probe(&mut self, store: &dyn GraphStore, session_id: &str) -> Result<u64> {
        match self {
            Detector::Cursor { last_seen } => {
                let probe = store.probe_unacknowledged_after(session_id, *last_seen).await?;
                if probe.count > 0 {
                    if let Some(max) = probe.max_seq {
                        *last_seen = (*last_seen).max(max);
                    }
                }
                Ok(probe.count)
            }
            Detector::RecencyWindow { window } => {
                let since = cutoff(Utc::now(), *window);
                Ok(store
                    .count_recent_unacknowledged(session_id, since)
                    .await?
                    .count)
            }
        }
    }
}

struct PollLoop {
    session_id: String,
    store: Arc<dyn GraphStore>,
    events: EventBus,
    diagnostics: Arc<DiagnosticLog>,
    registry: Arc<SessionRegistry>,
    detector: Detector,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(mut self) {
        let mut last_heartbeat = Instant::now();

        loop {
            self.shared.enter(ListenerState::Idle);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            self.shared.enter(ListenerState::Polling);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.detector.probe(&*self.store, &self.session_id) => r,
            };
            self.shared.polls.fetch_add(1, Ordering::SeqCst);

            match result {
                Ok(0) => {}
                Ok(count) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    debug!(session_id = %self.session_id, count, "Changes detected, requesting pull");
                    self.shared.detections.fetch_add(1, Ordering::SeqCst);
                    self.events
                        .emit(SyncEvent::pull_requested(&self.session_id, count));
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, "Change probe failed: {:#}", e);
                    self.diagnostics
                        .record(&self.session_id, "listener: probe", &e);
                }
            }

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                let beat = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    r = self.registry.heartbeat() => r,
                };
                if let Err(e) = beat {
                    warn!(session_id = %self.session_id, "{:#}", e);
                }
                last_heartbeat = Instant::now();
            }
        }

        self.shared.force(ListenerState::Stopped);
        debug!(session_id = %self.session_id, "Listener loop finished");
    }
}

/// Background poller for ChangeLog entries addressed to this session
pub struct ChangeListener {
    session_id: String,
    detection: DetectionMode,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    dispose_grace: Duration,
}

impl ChangeListener {
    /// Spawn the polling task on the current runtime
    pub fn start(ctx: &SyncContext, registry: Arc<SessionRegistry>) -> Self {
        let settings = &ctx.settings;
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ListenerState::Idle as u8),
            polls: AtomicU64::new(0),
            detections: AtomicU64::new(0),
        });

        let poll = PollLoop {
            session_id: ctx.session_id.clone(),
            store: ctx.store.clone(),
            events: ctx.events.clone(),
            diagnostics: ctx.diagnostics.clone(),
            registry,
            detector: Detector::new(settings.detection, settings.recency_window),
            poll_interval: settings.poll_interval,
            heartbeat_interval: settings.heartbeat_interval,
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(poll.run());

        info!(
            session_id = %ctx.session_id,
            detection = %settings.detection,
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            "Change listener started"
        );

        Self {
            session_id: ctx.session_id.clone(),
            detection: settings.detection,
            cancel,
            handle: Mutex::new(Some(handle)),
            shared,
            dispose_grace: settings.dispose_grace,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    pub fn detection(&self) -> DetectionMode {
        self.detection
    }

    /// Completed probes, successful or not
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::SeqCst)
    }

    /// Probes that raised a pull request
    pub fn detection_count(&self) -> u64 {
        self.shared.detections.load(Ordering::SeqCst)
    }

    /// Cancel the loop and wait up to the dispose grace for it to exit.
    ///
    /// A loop that does not stop in time is aborted. Later calls return at once.
    pub async fn dispose(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return;
        };

        self.shared.force(ListenerState::Disposing);
        self.cancel.cancel();

        match tokio::time::timeout(self.dispose_grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %self.session_id, "Listener task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    "Listener did not stop within {:?}, abandoning",
                    self.dispose_grace
                );
                handle.abort();
            }
        }

        self.shared.force(ListenerState::Stopped);
        info!(session_id = %self.session_id, "Change listener disposed");
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
