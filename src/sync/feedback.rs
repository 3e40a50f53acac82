//! Feedback-loop suppression
//!
//! While the host applies a pull, the local document fires mutation
//! callbacks for the changes it is importing. Writing those back would bounce
//! them to every other session, so mutations of the suppressed kinds are
//! dropped for the duration of the pull.

use crate::building::EntityKind;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "pull in progress" flag plus the kinds it silences
#[derive(Debug, Clone)]
pub struct PullGuard {
    active: Arc<AtomicBool>,
    suppressed: Arc<HashSet<EntityKind>>,
}

impl PullGuard {
    pub fn new(suppressed_kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            suppressed: Arc::new(suppressed_kinds.into_iter().collect()),
        }
    }

    /// Set or clear the flag directly
    pub fn set(&self, in_progress: bool) {
        let was = self.active.swap(in_progress, Ordering::SeqCst);
        if was != in_progress {
            tracing::debug!(in_progress, "Pull-in-progress flag changed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Set the flag until the returned scope is dropped
    pub fn begin(&self) -> PullScope {
        self.set(true);
        PullScope {
            guard: self.clone(),
        }
    }

    /// Whether a mutation of `kind` must be dropped right now
    pub fn suppresses(&self, kind: EntityKind) -> bool {
        self.is_active() && self.suppressed.contains(&kind)
    }
}

/// Clears the pull flag on drop
#[must_use = "the pull flag is cleared as soon as the scope is dropped"]
pub struct PullScope {
    guard: PullGuard,
}

impl Drop for PullScope {
    fn drop(&mut self) {
        self.guard.set(false);
    }
}
