//! Composition root wiring storage, queue, coordinator, and triggers.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::net::ConnectivityMonitor;
use crate::queue::{
  BackgroundSync, ChangeQueue, NoopBackgroundSync, QueueOutcome, QueuedChange, SyncTaskRegistry,
  Table, QUEUE_KEY, TASKS_KEY,
};
use crate::remote::RemoteStore;
use crate::storage::{KeyValueStore, StorageCache};
use crate::sync::{EventSource, SyncCoordinator, SyncEvent, SyncStatus, FAILED_KEY};

/// The offline-first sync engine.
///
/// Explicitly constructed from injected collaborators; there is no process-
/// wide instance. Tests build isolated engines over in-memory stores.
pub struct SyncEngine {
  cache: Arc<StorageCache>,
  queue: Arc<ChangeQueue>,
  tasks: Arc<SyncTaskRegistry>,
  coordinator: Arc<SyncCoordinator>,
  connectivity: ConnectivityMonitor,
  background: Arc<dyn BackgroundSync>,
}

impl SyncEngine {
  pub fn new(
    config: &Config,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
  ) -> Self {
    let cache = Arc::new(
      StorageCache::new(store)
        .with_debounce(config.debounce())
        .with_default_ttl(config.ttl())
        .with_protected_keys(&[QUEUE_KEY, TASKS_KEY, FAILED_KEY]),
    );

    let queue = Arc::new(ChangeQueue::new(cache.clone()));
    let tasks = Arc::new(
      SyncTaskRegistry::new(cache.clone()).with_max_retries(config.sync.background_max_retries),
    );
    let connectivity = ConnectivityMonitor::new(true);

    let coordinator = Arc::new(
      SyncCoordinator::new(
        cache.clone(),
        queue.clone(),
        tasks.clone(),
        remote,
        connectivity.clone(),
      )
      .with_max_retries(config.sync.max_retries)
      .with_base_delay(config.retry_base_delay()),
    );

    Self {
      cache,
      queue,
      tasks,
      coordinator,
      connectivity,
      background: Arc::new(NoopBackgroundSync),
    }
  }

  /// Replace the background-sync strategy (default: facility absent).
  pub fn with_background(mut self, background: Arc<dyn BackgroundSync>) -> Self {
    self.background = background;
    self
  }

  /// Queue a local mutation for later reconciliation.
  ///
  /// The change is mirrored into the background task registry; a delete
  /// that cancels a pending create prunes the create's mirror instead.
  pub fn queue_change(&self, change: QueuedChange) {
    match self.queue.queue_change(change.clone()) {
      QueueOutcome::Appended => {
        self.tasks.register(&change);
        if self.background.request_sync() {
          debug!(
            "Background sync requested for {}/{}",
            change.table_name, change.record_id
          );
        }
      }
      QueueOutcome::CancelledCreate => {
        self.tasks.remove_for(change.table_name, &change.record_id);
      }
    }
  }

  /// Run one sync pass now.
  pub async fn sync_now(&self) {
    self.coordinator.sync_now().await;
  }

  pub fn pause_sync(&self) {
    self.coordinator.pause_sync();
  }

  pub fn resume_sync(&self) {
    self.coordinator.resume_sync();
  }

  pub fn status(&self) -> SyncStatus {
    self.coordinator.status()
  }

  pub fn pending(&self) -> Vec<QueuedChange> {
    self.queue.pending()
  }

  pub fn failed(&self) -> Vec<QueuedChange> {
    self.coordinator.failed()
  }

  /// Prune queued entries for records removed elsewhere in the app.
  pub fn remove_changes(&self, table: Table, record_ids: &[String]) {
    self.queue.remove_for(table, record_ids);
  }

  /// Empty the queue and the parallel background task registry.
  pub fn clear_queue(&self) {
    self.queue.clear();
    self.tasks.clear();
  }

  /// Drain the background task registry once; for platform background-sync
  /// integrations.
  pub async fn process_background_tasks(&self) {
    self.coordinator.process_background_tasks().await;
  }

  /// The cache the rest of the application reads and writes through.
  pub fn cache(&self) -> &StorageCache {
    &self.cache
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  /// Drive the engine until the source closes or a shutdown event arrives.
  pub async fn run(&self, mut events: EventSource) {
    info!("Sync engine running");

    while let Some(event) = events.next().await {
      match event {
        SyncEvent::FlushDue => self.cache.flush_due(),
        SyncEvent::Tick | SyncEvent::SyncRequested => self.coordinator.sync_now().await,
        SyncEvent::ConnectivityChanged(online) => {
          // Idempotent when the monitor itself originated the event
          self.connectivity.set_online(online);
          if online {
            self.coordinator.sync_now().await;
          }
        }
        SyncEvent::Shutdown => break,
      }
    }

    // Teardown: no debounced write may be lost
    self.cache.flush();
    info!("Sync engine stopped");
  }
}
