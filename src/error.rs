//! Error types shared by the cache, the remote client and the sync engine.

use thiserror::Error;

/// Failures talking to the remote collection.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The remote asked us to slow down. Retryable.
  #[error("rate limited by remote")]
  RateLimited,

  /// Anything else. Fatal for the current fetch attempt.
  #[error("remote error: {0}")]
  Remote(String),
}

impl FetchError {
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, FetchError::RateLimited)
  }
}

/// Failures of the local cache store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The store handle was never opened or has been closed.
  #[error("cache store is not initialized")]
  NotInitialized,

  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize cached value: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("cache worker failed: {0}")]
  Task(String),

  #[error("failed to prepare cache location: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors surfaced by the public sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;
