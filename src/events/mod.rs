//! Sync event system
//!
//! This module provides:
//! - `SyncEvent`: events raised for the host application (pull requests)
//! - `EventBus`: broadcast channel distributing events to subscribers

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventEmitter, SyncEvent};
