//! Offline-first change queue and sync engine for local-first apps.
//!
//! The engine lets an application keep mutating data while disconnected
//! from its remote backend: mutations are persisted durably and in order,
//! deduplicated at insertion time, and reconciled once connectivity
//! returns. Replay order and exactly-once removal hold under retries,
//! quota pressure, and overlapping trigger sources.
//!
//! The pieces compose at [`engine::SyncEngine`]: a [`storage::StorageCache`]
//! over an injected [`storage::KeyValueStore`], a durable
//! [`queue::ChangeQueue`], and a [`sync::SyncCoordinator`] draining against
//! an injected [`remote::RemoteStore`].

pub mod config;
pub mod engine;
pub mod net;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use engine::SyncEngine;
pub use queue::{Operation, Payload, QueuedChange, Table};
pub use remote::{RemoteError, RemoteStore, RestRemote};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageCache};
pub use sync::{EventSource, SyncEvent, SyncStatus};
