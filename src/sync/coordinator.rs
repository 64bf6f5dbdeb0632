//! Drain, retry, and failure escalation for the change queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::net::ConnectivityMonitor;
use crate::queue::{ChangeQueue, Operation, QueuedChange, SyncTaskRegistry};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::StorageCache;

/// Storage key holding entries that exhausted their retries. Must stay
/// stable across reloads.
pub const FAILED_KEY: &str = "syncline:failed_changes";

/// Attempts per entry before it is moved to the failed bucket.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Caller-visible snapshot of the engine's sync state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
  pub pending: usize,
  pub failed: usize,
  pub is_syncing: bool,
  pub is_online: bool,
  pub paused: bool,
  pub last_sync_at: Option<DateTime<Utc>>,
}

/// Releases the in-progress flag on every exit path, including panics and
/// early returns inside the pass.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Drives reconciliation of the change queue against the remote store.
///
/// At most one sync pass runs at a time: a trigger arriving mid-pass is
/// rejected, not queued. Entries are processed strictly in FIFO order, one
/// at a time, because later entries may depend on records created by
/// earlier ones in the same pass.
pub struct SyncCoordinator {
  cache: Arc<StorageCache>,
  queue: Arc<ChangeQueue>,
  tasks: Arc<SyncTaskRegistry>,
  remote: Arc<dyn RemoteStore>,
  connectivity: ConnectivityMonitor,
  max_retries: u32,
  base_delay: Duration,
  in_progress: AtomicBool,
  paused: AtomicBool,
  last_sync: Mutex<Option<DateTime<Utc>>>,
  // Serializes read-modify-write cycles on the failed bucket.
  failed_ops: Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    cache: Arc<StorageCache>,
    queue: Arc<ChangeQueue>,
    tasks: Arc<SyncTaskRegistry>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
  ) -> Self {
    Self {
      cache,
      queue,
      tasks,
      remote,
      connectivity,
      max_retries: DEFAULT_MAX_RETRIES,
      base_delay: Duration::from_millis(1000),
      in_progress: AtomicBool::new(false),
      paused: AtomicBool::new(false),
      last_sync: Mutex::new(None),
      failed_ops: Mutex::new(()),
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
    self.base_delay = base_delay;
    self
  }

  /// Run one sync pass now, unless paused, offline, or already running.
  pub async fn sync_now(&self) {
    if self.paused.load(Ordering::SeqCst) {
      debug!("Sync paused, ignoring trigger");
      return;
    }

    if !self.connectivity.is_online() {
      debug!("Offline, ignoring sync trigger");
      return;
    }

    if self
      .in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Sync already in progress, ignoring trigger");
      return;
    }
    let _guard = DrainGuard(&self.in_progress);

    self.drain().await;

    *self
      .last_sync
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
  }

  async fn drain(&self) {
    let pending = self.queue.pending();
    if pending.is_empty() {
      debug!("Nothing to sync");
      return;
    }

    info!("Starting sync pass: {} pending changes", pending.len());

    for mut change in pending {
      loop {
        // Increment-before-attempt: the counter is persisted before the
        // dispatch, so a crash mid-attempt consumes the attempt instead of
        // repeating it without bound.
        change.retry_attempts += 1;
        self.queue.update_attempts(&change);

        match self.apply(&change).await {
          Ok(()) => {
            info!(
              "Applied {} for {}/{}",
              change.operation_type, change.table_name, change.record_id
            );
            self.queue.remove_entry(&change);
            self.tasks.remove_for(change.table_name, &change.record_id);
            break;
          }
          Err(err) => {
            warn!(
              "Sync attempt {} failed for {}/{}: {}",
              change.retry_attempts, change.table_name, change.record_id, err
            );

            if change.retry_attempts >= self.max_retries {
              // Failed bucket first: a crash between the two writes must
              // not lose the entry.
              self.escalate(change.clone());
              self.queue.remove_entry(&change);
              break;
            }

            tokio::time::sleep(self.base_delay * change.retry_attempts).await;
          }
        }
      }
    }
  }

  /// Dispatch one change, mapping idempotent outcomes to success.
  async fn apply(&self, change: &QueuedChange) -> Result<(), RemoteError> {
    match change.operation_type {
      Operation::Create => {
        match self.remote.insert(change.table_name, &change.payload).await {
          Err(RemoteError::Conflict) => {
            debug!(
              "Create for {}/{} already exists remotely, treating as applied",
              change.table_name, change.record_id
            );
            Ok(())
          }
          result => result,
        }
      }
      Operation::Update => {
        self
          .remote
          .update_by_id(change.table_name, &change.record_id, &change.payload)
          .await
      }
      Operation::Delete => {
        match self.remote.delete_by_id(change.table_name, &change.record_id).await {
          Err(RemoteError::NotFound) => {
            debug!(
              "Delete for {}/{} already gone remotely, treating as applied",
              change.table_name, change.record_id
            );
            Ok(())
          }
          result => result,
        }
      }
    }
  }

  /// Move an exhausted entry to the durable failed bucket, held for manual
  /// inspection and never auto-retried.
  fn escalate(&self, change: QueuedChange) {
    warn!(
      "Moving {} for {}/{} to failed bucket after {} attempts",
      change.operation_type, change.table_name, change.record_id, change.retry_attempts
    );

    let _guard = self.lock_failed_ops();
    let mut failed = self.load_failed();
    failed.push(change);
    self.cache.set(FAILED_KEY, failed, true);
  }

  /// Drain the background task registry, one attempt per task per call.
  ///
  /// Invoked by platform background-execution integrations; the core run
  /// loop never calls this.
  pub async fn process_background_tasks(&self) {
    if !self.connectivity.is_online() {
      return;
    }

    for task in self.tasks.tasks() {
      let change = task.as_change();
      match self.apply(&change).await {
        Ok(()) => {
          info!(
            "Background task applied {} for {}/{}",
            change.operation_type, change.table_name, change.record_id
          );
          self.tasks.remove(&task.id);
        }
        Err(err) => {
          warn!("Background task {} failed: {}", task.id, err);
          self.tasks.record_failure(&task.id);
        }
      }
    }
  }

  /// Suspend draining. While paused, every trigger is a no-op; queued
  /// changes keep accumulating normally.
  pub fn pause_sync(&self) {
    info!("Sync paused");
    self.paused.store(true, Ordering::SeqCst);
  }

  /// Re-enable normal draining.
  pub fn resume_sync(&self) {
    info!("Sync resumed");
    self.paused.store(false, Ordering::SeqCst);
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  pub fn is_syncing(&self) -> bool {
    self.in_progress.load(Ordering::SeqCst)
  }

  /// Entries that exhausted their retries.
  pub fn failed(&self) -> Vec<QueuedChange> {
    self.load_failed()
  }

  pub fn clear_failed(&self) {
    let _guard = self.lock_failed_ops();
    self.cache.set(FAILED_KEY, Vec::<QueuedChange>::new(), true);
  }

  pub fn status(&self) -> SyncStatus {
    SyncStatus {
      pending: self.queue.len(),
      failed: self.load_failed().len(),
      is_syncing: self.is_syncing(),
      is_online: self.connectivity.is_online(),
      paused: self.is_paused(),
      last_sync_at: *self
        .last_sync
        .lock()
        .unwrap_or_else(PoisonError::into_inner),
    }
  }

  fn load_failed(&self) -> Vec<QueuedChange> {
    self.cache.get::<Vec<QueuedChange>>(FAILED_KEY).unwrap_or_default()
  }

  fn lock_failed_ops(&self) -> MutexGuard<'_, ()> {
    self.failed_ops.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
