//! Durable, ordered pending-mutation list with dedup at insertion time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::change::{Operation, QueuedChange, Table};
use crate::storage::StorageCache;

/// Storage key holding the ordered pending-change list. Must stay stable
/// across reloads.
pub const QUEUE_KEY: &str = "syncline:pending_changes";

/// What `queue_change` did with the incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
  /// Appended at the tail of the pending list.
  Appended,
  /// A delete met a pending create for the same record; the create was
  /// removed and nothing was appended (the record never reached the remote
  /// store, so there is nothing to delete there).
  CancelledCreate,
}

/// Ordered, durable list of not-yet-reconciled local mutations.
///
/// Persisted as a single entry through the [`StorageCache`] with immediate
/// writes: a queue entry must not be lost to a debounce window on teardown.
pub struct ChangeQueue {
  cache: Arc<StorageCache>,
  // Serializes read-modify-write cycles on the persisted list.
  ops: Mutex<()>,
}

impl ChangeQueue {
  pub fn new(cache: Arc<StorageCache>) -> Self {
    Self {
      cache,
      ops: Mutex::new(()),
    }
  }

  fn lock_ops(&self) -> MutexGuard<'_, ()> {
    self.ops.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Queue a mutation, applying the create/delete cancellation rule.
  pub fn queue_change(&self, change: QueuedChange) -> QueueOutcome {
    let _guard = self.lock_ops();
    let mut pending = self.load();

    if change.operation_type == Operation::Delete {
      let pending_create = pending.iter().position(|c| {
        c.operation_type == Operation::Create
          && c.table_name == change.table_name
          && c.record_id == change.record_id
      });

      if let Some(index) = pending_create {
        let removed = pending.remove(index);
        debug!(
          "Cancelled pending create for {}/{} before it was ever sent",
          removed.table_name, removed.record_id
        );
        self.persist(&pending);
        return QueueOutcome::CancelledCreate;
      }
    }

    pending.push(change);
    self.persist(&pending);
    QueueOutcome::Appended
  }

  /// The current ordered pending list, read through the cache on cold start.
  pub fn pending(&self) -> Vec<QueuedChange> {
    self.load()
  }

  pub fn len(&self) -> usize {
    self.load().len()
  }

  pub fn is_empty(&self) -> bool {
    self.load().is_empty()
  }

  /// Prune entries for records that no longer exist locally (e.g. after a
  /// bulk delete elsewhere in the app).
  pub fn remove_for(&self, table: Table, record_ids: &[String]) {
    let _guard = self.lock_ops();
    let mut pending = self.load();
    pending.retain(|c| !(c.table_name == table && record_ids.contains(&c.record_id)));
    self.persist(&pending);
  }

  /// Persist an updated retry counter for one entry, matched by identity.
  pub(crate) fn update_attempts(&self, change: &QueuedChange) {
    let _guard = self.lock_ops();
    let mut pending = self.load();
    if let Some(entry) = pending.iter_mut().find(|c| c.same_change(change)) {
      entry.retry_attempts = change.retry_attempts;
      self.persist(&pending);
    }
  }

  /// Permanently remove one entry, matched by identity.
  pub(crate) fn remove_entry(&self, change: &QueuedChange) {
    let _guard = self.lock_ops();
    let mut pending = self.load();
    if let Some(index) = pending.iter().position(|c| c.same_change(change)) {
      pending.remove(index);
      self.persist(&pending);
    }
  }

  /// Empty the queue.
  pub fn clear(&self) {
    let _guard = self.lock_ops();
    self.persist(&[]);
  }

  fn load(&self) -> Vec<QueuedChange> {
    self.cache.get::<Vec<QueuedChange>>(QUEUE_KEY).unwrap_or_default()
  }

  fn persist(&self, pending: &[QueuedChange]) {
    self.cache.set(QUEUE_KEY, pending.to_vec(), true);
  }
}
