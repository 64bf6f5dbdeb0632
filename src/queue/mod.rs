//! The durable change queue and the background-sync task registry.

mod change;
mod queue;
mod tasks;

pub use change::{Operation, Payload, QueuedChange, Table};
pub use queue::{ChangeQueue, QueueOutcome, QUEUE_KEY};
pub use tasks::{
  BackgroundSync, NoopBackgroundSync, SyncTask, SyncTaskRegistry, DEFAULT_BACKGROUND_MAX_RETRIES,
  TASKS_KEY,
};
