//! Models of the sync bookkeeping nodes stored next to the building graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::building::ElementHandle;

/// Kind of local mutation a ChangeLog entry reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Modify,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Insert => write!(f, "Insert"),
            ChangeOperation::Modify => write!(f, "Modify"),
            ChangeOperation::Delete => write!(f, "Delete"),
        }
    }
}

impl FromStr for ChangeOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(ChangeOperation::Insert),
            "Modify" => Ok(ChangeOperation::Modify),
            "Delete" => Ok(ChangeOperation::Delete),
            other => Err(format!("unknown change operation '{}'", other)),
        }
    }
}

/// `(:ChangeLog)` node addressed to one target session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: Uuid,
    pub target_element_id: ElementHandle,
    pub operation: ChangeOperation,
    /// Session that must pull this change
    pub session_id: String,
    /// Session that made the change
    pub source_session_id: String,
    pub acknowledged: bool,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the store on creation; monotonic per target session
    pub seq: Option<i64>,
}

impl ChangeLogEntry {
    pub fn new(
        target_element_id: ElementHandle,
        operation: ChangeOperation,
        session_id: impl Into<String>,
        source_session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_element_id,
            operation,
            session_id: session_id.into(),
            source_session_id: source_session_id.into(),
            acknowledged: false,
            timestamp: Utc::now(),
            seq: None,
        }
    }
}

/// `(:Session)` registry node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNode {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of one unacknowledged-change probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeProbe {
    pub count: u64,
    /// Highest `seq` among the counted entries
    pub max_seq: Option<i64>,
}
