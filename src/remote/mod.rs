//! Remote data client boundary: the trait the coordinator drains against
//! and the failure taxonomy it classifies on.

mod rest;

pub use rest::RestRemote;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::{Payload, Table};

/// Typed failure from the remote store.
///
/// The coordinator treats [`RemoteError::Conflict`] on create and
/// [`RemoteError::NotFound`] on delete as idempotent successes; everything
/// else is retried up to the configured maximum.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
  /// Unique-constraint violation: the record already exists remotely.
  #[error("record already exists")]
  Conflict,
  /// The record is not present remotely.
  #[error("record not found")]
  NotFound,
  /// Network-level or throttling failure worth retrying.
  #[error("transient failure: {0}")]
  Transient(String),
  /// Any other rejection by the remote store.
  #[error("remote rejected request: {0}")]
  Rejected(String),
}

/// Table-scoped mutations against the remote store, applied as the current
/// user.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn insert(&self, table: Table, payload: &Payload) -> Result<(), RemoteError>;

  async fn update_by_id(&self, table: Table, id: &str, payload: &Payload)
    -> Result<(), RemoteError>;

  async fn delete_by_id(&self, table: Table, id: &str) -> Result<(), RemoteError>;
}
