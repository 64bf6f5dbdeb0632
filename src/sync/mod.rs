//! Sync triggers and the coordinator that drains the change queue.

mod coordinator;
mod events;

pub use coordinator::{SyncCoordinator, SyncStatus, DEFAULT_MAX_RETRIES, FAILED_KEY};
pub use events::{EventSource, SyncEvent};
