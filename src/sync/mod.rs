//! Synchronization of the local receipt mirror with the remote collection.
//!
//! Each request walks `Idle -> Deciding -> {NoOp, Delta, Full} -> Reconciling`:
//! - `Deciding` compares local and remote counts and checks watermark freshness
//! - `Delta` fetches only records newer than the watermark and appends them
//! - `Full` refetches everything and replaces the local record set
//! - `Reconciling` rebuilds the customer aggregates from the merged records

mod engine;
mod fetcher;
mod watermark;

use chrono::{DateTime, Utc};
use std::time::Duration;

pub use engine::{CacheStatus, SyncEngine};
pub use fetcher::PaginatedFetcher;
pub use watermark::{latest, Watermark, WatermarkTracker};

/// Progress callback: a human-readable status and the number of records accepted so far.
pub type Progress<'a> = &'a (dyn Fn(&str, usize) + Sync);

/// What a synchronization pass will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
  /// Serve the cached aggregates unchanged
  NoOp,
  /// Fetch records newer than `since` and append them
  Delta { since: DateTime<Utc> },
  /// Refetch the whole collection
  Full,
}

/// Choose between serving the cache, a delta fetch and a full fetch.
pub fn decide(
  local_count: usize,
  remote_total: u64,
  watermark: &Watermark,
  now: DateTime<Utc>,
  staleness_window: Duration,
) -> SyncDecision {
  match watermark.last_synced_timestamp {
    Some(since) if local_count as u64 == remote_total => {
      if watermark.is_stale(now, staleness_window) {
        SyncDecision::Delta { since }
      } else {
        SyncDecision::NoOp
      }
    }
    Some(since) if local_count > 0 => SyncDecision::Delta { since },
    _ => SyncDecision::Full,
  }
}

#[cfg(test)]
pub(crate) fn fast_config() -> crate::config::SyncConfig {
  use crate::config::{RetryPolicy, SyncConfig};

  SyncConfig {
    page_delay: Duration::ZERO,
    retry: RetryPolicy {
      initial_backoff: Duration::ZERO,
      max_backoff: Duration::ZERO,
      ..RetryPolicy::default()
    },
    ..SyncConfig::default()
  }
}
