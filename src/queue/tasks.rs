//! Background-sync fallback registry.
//!
//! Queued changes are mirrored into an independently persisted task list
//! with its own id and retry namespace, so a platform background-execution
//! facility can keep retrying after the primary queue is gone. The facility
//! is a capability-checked supplement: with [`NoopBackgroundSync`] the
//! registry is inert bookkeeping and the engine behaves identically.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::change::{Operation, Payload, QueuedChange, Table};
use crate::storage::StorageCache;

/// Storage key holding the task registry. Must stay stable across reloads.
pub const TASKS_KEY: &str = "syncline:sync_tasks";

/// Retry cap for background tasks; higher than the primary queue's because
/// background execution is the last line of defense.
pub const DEFAULT_BACKGROUND_MAX_RETRIES: u32 = 5;

/// A queued change mirrored for background execution, with its own id and
/// its own retry counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
  pub id: String,
  pub operation_type: Operation,
  pub table_name: Table,
  pub record_id: String,
  pub payload: Payload,
  pub created_at: DateTime<Utc>,
  pub retries: u32,
}

impl SyncTask {
  fn for_change(change: &QueuedChange) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      operation_type: change.operation_type,
      table_name: change.table_name,
      record_id: change.record_id.clone(),
      payload: change.payload.clone(),
      created_at: Utc::now(),
      retries: 0,
    }
  }

  /// View this task as a queued change for dispatch.
  pub fn as_change(&self) -> QueuedChange {
    QueuedChange {
      operation_type: self.operation_type,
      table_name: self.table_name,
      record_id: self.record_id.clone(),
      payload: self.payload.clone(),
      enqueued_at: self.created_at,
      retry_attempts: self.retries,
    }
  }
}

/// Durable registry of background sync tasks.
pub struct SyncTaskRegistry {
  cache: Arc<StorageCache>,
  ops: Mutex<()>,
  max_retries: u32,
}

impl SyncTaskRegistry {
  pub fn new(cache: Arc<StorageCache>) -> Self {
    Self {
      cache,
      ops: Mutex::new(()),
      max_retries: DEFAULT_BACKGROUND_MAX_RETRIES,
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  fn lock_ops(&self) -> MutexGuard<'_, ()> {
    self.ops.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Mirror a queued change into the registry.
  pub fn register(&self, change: &QueuedChange) -> SyncTask {
    let _guard = self.lock_ops();
    let task = SyncTask::for_change(change);
    let mut tasks = self.load();
    tasks.push(task.clone());
    self.persist(&tasks);
    task
  }

  pub fn tasks(&self) -> Vec<SyncTask> {
    self.load()
  }

  pub fn len(&self) -> usize {
    self.load().len()
  }

  pub fn is_empty(&self) -> bool {
    self.load().is_empty()
  }

  /// Remove one task by id.
  pub fn remove(&self, id: &str) {
    let _guard = self.lock_ops();
    let mut tasks = self.load();
    tasks.retain(|t| t.id != id);
    self.persist(&tasks);
  }

  /// Remove every task mirroring the given record.
  pub fn remove_for(&self, table: Table, record_id: &str) {
    let _guard = self.lock_ops();
    let mut tasks = self.load();
    tasks.retain(|t| !(t.table_name == table && t.record_id == record_id));
    self.persist(&tasks);
  }

  /// Count a failed attempt for one task. Returns `false` when the task hit
  /// its retry cap and was dropped.
  pub fn record_failure(&self, id: &str) -> bool {
    let _guard = self.lock_ops();
    let mut tasks = self.load();

    let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
      return false;
    };

    task.retries += 1;
    let kept = task.retries < self.max_retries;
    if !kept {
      warn!(
        "Dropping background task {} for {}/{} after {} attempts",
        id, task.table_name, task.record_id, task.retries
      );
      tasks.retain(|t| t.id != id);
    }

    self.persist(&tasks);
    kept
  }

  /// Empty the registry.
  pub fn clear(&self) {
    let _guard = self.lock_ops();
    self.persist(&[]);
  }

  fn load(&self) -> Vec<SyncTask> {
    self.cache.get::<Vec<SyncTask>>(TASKS_KEY).unwrap_or_default()
  }

  fn persist(&self, tasks: &[SyncTask]) {
    self.cache.set(TASKS_KEY, tasks.to_vec(), true);
  }
}

/// Optional platform facility for scheduling a sync drain while the
/// application is not foregrounded.
pub trait BackgroundSync: Send + Sync {
  /// Ask the platform to schedule a background drain. Returns `false` when
  /// the facility is unavailable; the core never depends on it.
  fn request_sync(&self) -> bool;
}

/// Default strategy: no platform facility.
pub struct NoopBackgroundSync;

impl BackgroundSync for NoopBackgroundSync {
  fn request_sync(&self) -> bool {
    false
  }
}
