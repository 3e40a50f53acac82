//! Sync event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events raised by the sync core for the host application
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Other sessions wrote changes addressed to `session_id`; the host
    /// should pull and then acknowledge
    PullRequested {
        session_id: String,
        change_count: u64,
        detected_at: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn pull_requested(session_id: impl Into<String>, change_count: u64) -> Self {
        SyncEvent::PullRequested {
            session_id: session_id.into(),
            change_count,
            detected_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SyncEvent::PullRequested { session_id, .. } => session_id,
        }
    }
}

/// Anything that can publish sync events
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SyncEvent);
}
