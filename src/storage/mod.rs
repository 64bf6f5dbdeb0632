//! Local persistence: the raw key/value store and the memoizing,
//! debounced, quota-aware cache every other component goes through.

mod cache;
mod store;

pub use cache::{StorageCache, DEFAULT_DEBOUNCE, DEFAULT_TTL};
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
