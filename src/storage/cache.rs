//! Memoizing, debounced, quota-aware layer over the persistent store.
//!
//! Every other component reads and writes through this cache instead of
//! touching the raw store. Reads are memoized with a TTL. Writes are
//! coalesced per key through an explicit scheduled-write table, and a
//! quota-exceeded write is recovered by evicting non-protected keys and
//! retrying once.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::store::{KeyValueStore, StorageError};

/// How long a memoized value stays fresh before the next read goes back to
/// the persistent store.
pub const DEFAULT_TTL: Duration = Duration::from_millis(60_000);

/// Quiet period a non-immediate write waits for before being persisted.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

struct CacheEntry {
  data: Box<dyn Any + Send + Sync>,
  cached_at: Instant,
  ttl: Duration,
}

impl CacheEntry {
  fn is_fresh(&self, now: Instant) -> bool {
    now.duration_since(self.cached_at) < self.ttl
  }
}

/// One scheduled durable write. A newer `set` for the same key replaces it.
struct PendingWrite {
  json: String,
  due_at: Instant,
}

#[derive(Default)]
struct CacheInner {
  entries: HashMap<String, CacheEntry>,
  pending: HashMap<String, PendingWrite>,
}

/// Memoized view of the persistent store.
pub struct StorageCache {
  store: Arc<dyn KeyValueStore>,
  inner: Mutex<CacheInner>,
  debounce: Duration,
  default_ttl: Duration,
  protected: Vec<String>,
}

impl StorageCache {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      inner: Mutex::new(CacheInner::default()),
      debounce: DEFAULT_DEBOUNCE,
      default_ttl: DEFAULT_TTL,
      protected: Vec::new(),
    }
  }

  /// Set the debounce window for non-immediate writes.
  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  /// Set the TTL applied to memoized values.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Mark keys that quota recovery must never evict (durable queue state).
  pub fn with_protected_keys(mut self, keys: &[&str]) -> Self {
    self.protected = keys.iter().map(|k| k.to_string()).collect();
    self
  }

  // Values are whole-value replacements, so state behind a poisoned lock is
  // still consistent.
  fn lock(&self) -> MutexGuard<'_, CacheInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a value, memoized with the default TTL.
  ///
  /// Returns `None` when the key is absent or the stored content fails to
  /// parse; parse failures are logged, never propagated.
  pub fn get<T>(&self, key: &str) -> Option<T>
  where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
  {
    self.get_with(key, self.default_ttl, |raw| match serde_json::from_str(raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!("Discarding unparseable stored value for {}: {}", key, e);
        None
      }
    })
  }

  /// Get a value with an explicit TTL and parser.
  pub fn get_with<T, P>(&self, key: &str, ttl: Duration, parser: P) -> Option<T>
  where
    T: Clone + Send + Sync + 'static,
    P: FnOnce(&str) -> Option<T>,
  {
    let now = Instant::now();
    let mut inner = self.lock();

    if let Some(entry) = inner.entries.get(key) {
      if entry.is_fresh(now) {
        if let Some(value) = entry.data.downcast_ref::<T>() {
          return Some(value.clone());
        }
      }
    }

    // A pending debounced write is newer than whatever the store holds.
    let raw = match inner.pending.get(key) {
      Some(pending) => Some(pending.json.clone()),
      None => match self.store.get_item(key) {
        Ok(value) => value,
        Err(e) => {
          warn!("Failed to read {} from storage: {}", key, e);
          None
        }
      },
    };

    let value = parser(&raw?)?;
    inner.entries.insert(
      key.to_string(),
      CacheEntry {
        data: Box::new(value.clone()),
        cached_at: now,
        ttl,
      },
    );
    Some(value)
  }

  /// Set a value.
  ///
  /// The in-memory entry is updated synchronously and unconditionally. The
  /// durable write is debounced unless `immediate` is set, with at most one
  /// scheduled write per key (a newer `set` cancels and replaces it).
  pub fn set<T>(&self, key: &str, value: T, immediate: bool)
  where
    T: Clone + Serialize + Send + Sync + 'static,
  {
    let json = match serde_json::to_string(&value) {
      Ok(json) => Some(json),
      Err(e) => {
        warn!("Failed to serialize value for {}: {}", key, e);
        None
      }
    };

    let now = Instant::now();
    let mut inner = self.lock();
    inner.entries.insert(
      key.to_string(),
      CacheEntry {
        data: Box::new(value),
        cached_at: now,
        ttl: self.default_ttl,
      },
    );

    let Some(json) = json else { return };

    if immediate {
      inner.pending.remove(key);
      self.write_through(&inner.entries, key, &json);
    } else {
      inner.pending.insert(
        key.to_string(),
        PendingWrite {
          json,
          due_at: now + self.debounce,
        },
      );
    }
  }

  /// Remove a key from memory, the scheduled-write table, and the store.
  pub fn remove(&self, key: &str) {
    let mut inner = self.lock();
    inner.pending.remove(key);
    inner.entries.remove(key);

    if let Err(e) = self.store.remove_item(key) {
      warn!("Failed to remove {} from storage: {}", key, e);
    }
  }

  /// Drop the memoized entry only; the next read goes back to the store.
  pub fn invalidate(&self, key: &str) {
    self.lock().entries.remove(key);
  }

  /// Persist every scheduled write whose debounce window has elapsed.
  pub fn flush_due(&self) {
    self.flush_matching(|pending, now| pending.due_at <= now);
  }

  /// Persist every scheduled write regardless of its deadline.
  ///
  /// Invoked on teardown so no debounced write is lost.
  pub fn flush(&self) {
    self.flush_matching(|_, _| true);
  }

  /// Number of writes currently waiting out their debounce window.
  pub fn pending_writes(&self) -> usize {
    self.lock().pending.len()
  }

  fn flush_matching<F>(&self, matches: F)
  where
    F: Fn(&PendingWrite, Instant) -> bool,
  {
    let mut inner = self.lock();
    let now = Instant::now();

    let due: Vec<String> = inner
      .pending
      .iter()
      .filter(|(_, pending)| matches(pending, now))
      .map(|(key, _)| key.clone())
      .collect();

    for key in due {
      if let Some(pending) = inner.pending.remove(&key) {
        self.write_through(&inner.entries, &key, &pending.json);
      }
    }
  }

  fn write_through(&self, entries: &HashMap<String, CacheEntry>, key: &str, json: &str) {
    match self.store.set_item(key, json) {
      Ok(()) => {}
      Err(StorageError::QuotaExceeded) => {
        warn!("Storage quota exceeded writing {}, attempting recovery", key);
        self.evict_and_retry(entries, key, json);
      }
      Err(e) => warn!("Failed to persist {}: {}", key, e),
    }
  }

  /// Evict roughly half of the non-protected persistent keys and retry the
  /// write once. If the retry still fails the write is abandoned with a
  /// warning; the in-memory value stays valid for the session.
  fn evict_and_retry(&self, entries: &HashMap<String, CacheEntry>, key: &str, json: &str) {
    let keys = match self.store.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!("Quota recovery aborted, cannot list storage keys: {}", e);
        return;
      }
    };

    let mut candidates: Vec<String> = keys
      .into_iter()
      .filter(|k| k != key && !self.protected.iter().any(|p| p == k))
      .collect();

    // Keys never touched this session first, then oldest-known-first.
    candidates.sort_by_key(|k| entries.get(k).map(|e| e.cached_at));

    let evict_count = (candidates.len() + 1) / 2;
    for evicted in candidates.iter().take(evict_count) {
      debug!("Evicting {} to reclaim storage space", evicted);
      if let Err(e) = self.store.remove_item(evicted) {
        debug!("Failed to evict {}: {}", evicted, e);
      }
    }

    if let Err(e) = self.store.set_item(key, json) {
      warn!("Write abandoned for {} after eviction: {}", key, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::store::MemoryStore;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Store double that counts reads and writes.
  struct CountingStore {
    inner: MemoryStore,
    reads: AtomicUsize,
    writes: AtomicUsize,
  }

  impl CountingStore {
    fn new() -> Self {
      Self {
        inner: MemoryStore::new(),
        reads: AtomicUsize::new(0),
        writes: AtomicUsize::new(0),
      }
    }

    fn reads(&self) -> usize {
      self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
      self.writes.load(Ordering::SeqCst)
    }
  }

  impl KeyValueStore for CountingStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
      self.writes.fetch_add(1, Ordering::SeqCst);
      self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
      self.inner.remove_item(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
      self.inner.keys()
    }
  }

  #[test]
  fn test_get_memoizes_reads() {
    let store = Arc::new(CountingStore::new());
    store.inner.set_item("k", "41").unwrap();

    let cache = StorageCache::new(store.clone());
    assert_eq!(cache.get::<u32>("k"), Some(41));
    assert_eq!(cache.get::<u32>("k"), Some(41));

    // Second read within the TTL window must not touch the store
    assert_eq!(store.reads(), 1);
  }

  #[test]
  fn test_ttl_expiry_rereads_once() {
    let store = Arc::new(CountingStore::new());
    store.inner.set_item("k", "41").unwrap();

    let cache = StorageCache::new(store.clone()).with_default_ttl(Duration::ZERO);
    assert_eq!(cache.get::<u32>("k"), Some(41));
    assert_eq!(cache.get::<u32>("k"), Some(41));
    assert_eq!(store.reads(), 2);
  }

  #[test]
  fn test_absent_and_corrupt_values_return_none() {
    let store = Arc::new(CountingStore::new());
    store.inner.set_item("bad", "not json").unwrap();

    let cache = StorageCache::new(store);
    assert_eq!(cache.get::<u32>("missing"), None);
    assert_eq!(cache.get::<u32>("bad"), None);
  }

  #[test]
  fn test_debounced_writes_coalesce() {
    let store = Arc::new(CountingStore::new());
    let cache = StorageCache::new(store.clone()).with_debounce(Duration::from_millis(20));

    cache.set("k", 1u32, false);
    cache.set("k", 2u32, false);

    // Nothing persisted yet; the in-memory value is already current
    assert_eq!(store.writes(), 0);
    assert_eq!(cache.get::<u32>("k"), Some(2));

    // Not due yet
    cache.flush_due();
    assert_eq!(store.writes(), 0);

    std::thread::sleep(Duration::from_millis(30));
    cache.flush_due();

    // Both sets collapsed into one write holding the latest value
    assert_eq!(store.writes(), 1);
    assert_eq!(store.inner.get_item("k").unwrap(), Some("2".to_string()));
  }

  #[test]
  fn test_immediate_write_skips_debounce() {
    let store = Arc::new(CountingStore::new());
    let cache = StorageCache::new(store.clone());

    cache.set("k", 7u32, true);
    assert_eq!(store.writes(), 1);
    assert_eq!(store.inner.get_item("k").unwrap(), Some("7".to_string()));
    assert_eq!(cache.pending_writes(), 0);
  }

  #[test]
  fn test_remove_cancels_pending_write() {
    let store = Arc::new(CountingStore::new());
    let cache = StorageCache::new(store.clone());

    cache.set("k", 7u32, false);
    cache.remove("k");
    cache.flush();

    assert_eq!(store.writes(), 0);
    assert_eq!(cache.get::<u32>("k"), None);
  }

  #[test]
  fn test_flush_persists_pending_writes() {
    let store = Arc::new(CountingStore::new());
    let cache = StorageCache::new(store.clone());

    cache.set("k", 7u32, false);
    cache.flush();

    assert_eq!(store.inner.get_item("k").unwrap(), Some("7".to_string()));
  }

  #[test]
  fn test_stale_read_sees_pending_write() {
    let store = Arc::new(CountingStore::new());
    let cache = StorageCache::new(store.clone()).with_default_ttl(Duration::ZERO);

    cache.set("k", 9u32, false);

    // TTL zero forces a fall-through read; it must surface the scheduled
    // write, not the (empty) store.
    assert_eq!(cache.get::<u32>("k"), Some(9));
  }

  #[test]
  fn test_quota_recovery_evicts_and_retries() {
    let store = Arc::new(MemoryStore::new().with_max_bytes(64));
    let cache = StorageCache::new(store.clone());

    cache.set("old1", "aaaaaaaaaa", true);
    cache.set("old2", "bbbbbbbbbb", true);

    // Too big to fit alongside both existing entries
    let big = "c".repeat(40);
    cache.set("new", big.clone(), true);

    assert_eq!(
      store.get_item("new").unwrap(),
      Some(format!("\"{}\"", big))
    );
    // Something was evicted to make room
    assert!(store.keys().unwrap().len() < 3);
  }

  #[test]
  fn test_quota_recovery_failure_keeps_memory_value() {
    // Budget too small for the value even after evicting everything
    let store = Arc::new(MemoryStore::new().with_max_bytes(8));
    let cache = StorageCache::new(store.clone());

    cache.set("k", "a long value that can never fit".to_string(), true);

    assert_eq!(store.get_item("k").unwrap(), None);
    assert_eq!(
      cache.get::<String>("k"),
      Some("a long value that can never fit".to_string())
    );
  }

  #[test]
  fn test_quota_recovery_spares_protected_keys() {
    let store = Arc::new(MemoryStore::new().with_max_bytes(96));
    let cache = StorageCache::new(store.clone()).with_protected_keys(&["queue"]);

    cache.set("queue", "pending-changes", true);
    cache.set("old1", "aaaaaaaaaa", true);
    cache.set("old2", "bbbbbbbbbb", true);
    cache.set("new", "c".repeat(40), true);

    assert_eq!(
      store.get_item("queue").unwrap(),
      Some("\"pending-changes\"".to_string())
    );
    assert!(store.get_item("new").unwrap().is_some());
  }
}
