//! Watermark persisted in the metadata partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, Cacheable, Partition};
use crate::error::{StoreError, StoreResult};
use crate::model::Receipt;

const LAST_SYNCED_ID: &str = "last_synced_id";
const LAST_SYNCED_TIMESTAMP: &str = "last_synced_timestamp";
const LAST_REFRESH_TIME: &str = "last_refresh_time";

/// Marker of the most recently synchronized record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Watermark {
  pub last_synced_id: Option<String>,
  pub last_synced_timestamp: Option<DateTime<Utc>>,
  pub last_refresh_time: Option<DateTime<Utc>>,
}

impl Watermark {
  /// A watermark is usable for delta fetches once it carries a timestamp.
  pub fn is_present(&self) -> bool {
    self.last_synced_timestamp.is_some()
  }

  /// True when no refresh happened within `window` of `now`.
  pub fn is_stale(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    match self.last_refresh_time {
      Some(at) => now.signed_duration_since(at) > window,
      None => true,
    }
  }
}

/// One named value in the metadata partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataEntry {
  name: String,
  value: Value,
}

impl Cacheable for MetadataEntry {
  fn cache_key(&self) -> String {
    self.name.clone()
  }

  fn partition() -> Partition {
    Partition::Metadata
  }
}

impl MetadataEntry {
  fn new(name: &str, value: impl Serialize) -> StoreResult<Self> {
    Ok(Self {
      name: name.to_string(),
      value: serde_json::to_value(value)?,
    })
  }
}

/// Reads and writes the watermark.
pub struct WatermarkTracker<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> WatermarkTracker<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  pub async fn read(&self) -> StoreResult<Watermark> {
    Ok(Watermark {
      last_synced_id: self.read_entry(LAST_SYNCED_ID).await?,
      last_synced_timestamp: self.read_entry(LAST_SYNCED_TIMESTAMP).await?,
      last_refresh_time: self.read_entry(LAST_REFRESH_TIME).await?,
    })
  }

  async fn read_entry<T: serde::de::DeserializeOwned>(&self, name: &str) -> StoreResult<Option<T>> {
    match self.storage.get::<MetadataEntry>(name).await? {
      Some(entry) if !entry.value.is_null() => Ok(Some(serde_json::from_value(entry.value)?)),
      _ => Ok(None),
    }
  }

  /// Move the watermark to `record`. Older records leave it untouched.
  ///
  /// An unreadable stored timestamp is overwritten.
  pub async fn advance(&self, record: &Receipt) -> StoreResult<()> {
    let current = match self.read_entry::<DateTime<Utc>>(LAST_SYNCED_TIMESTAMP).await {
      Ok(current) => current,
      Err(StoreError::NotInitialized) => return Err(StoreError::NotInitialized),
      Err(e) => {
        warn!("unreadable watermark timestamp, overwriting: {}", e);
        None
      }
    };
    if let Some(current) = current {
      if record.created_at < current {
        debug!(%current, candidate = %record.created_at, "ignoring watermark regression");
        return Ok(());
      }
    }

    self
      .storage
      .put(&[
        MetadataEntry::new(LAST_SYNCED_ID, record.key())?,
        MetadataEntry::new(LAST_SYNCED_TIMESTAMP, record.created_at)?,
      ])
      .await?;
    debug!(id = %record.key(), timestamp = %record.created_at, "watermark advanced");
    Ok(())
  }

  pub async fn touch_refresh_time(&self, now: DateTime<Utc>) -> StoreResult<()> {
    self
      .storage
      .put(&[MetadataEntry::new(LAST_REFRESH_TIME, now)?])
      .await
  }

  /// Forget the watermark entirely.
  pub async fn reset(&self) -> StoreResult<()> {
    self.storage.clear::<MetadataEntry>().await
  }
}

/// The record with the greatest timestamp, by full scan.
pub fn latest(records: &[Receipt]) -> Option<&Receipt> {
  records.iter().max_by_key(|r| r.created_at)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::model::fixtures::{at, receipt};
  use std::time::Duration;

  fn tracker() -> WatermarkTracker<SqliteStorage> {
    WatermarkTracker::new(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  #[tokio::test]
  async fn test_empty_watermark() {
    let wm = tracker().read().await.unwrap();
    assert_eq!(wm, Watermark::default());
    assert!(!wm.is_present());
  }

  #[tokio::test]
  async fn test_advance_never_regresses() {
    let tracker = tracker();
    tracker.advance(&receipt(10)).await.unwrap();
    tracker.advance(&receipt(5)).await.unwrap();

    let wm = tracker.read().await.unwrap();
    assert_eq!(wm.last_synced_id.as_deref(), Some("r0010"));
    assert_eq!(wm.last_synced_timestamp, Some(at(10)));

    tracker.advance(&receipt(11)).await.unwrap();
    let wm = tracker.read().await.unwrap();
    assert_eq!(wm.last_synced_timestamp, Some(at(11)));
  }

  #[tokio::test]
  async fn test_advance_overwrites_unreadable_timestamp() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .put(&[MetadataEntry::new(LAST_SYNCED_TIMESTAMP, "garbage").unwrap()])
      .await
      .unwrap();
    let tracker = WatermarkTracker::new(Arc::clone(&storage));
    assert!(tracker.read().await.is_err());

    tracker.advance(&receipt(4)).await.unwrap();

    let wm = tracker.read().await.unwrap();
    assert_eq!(wm.last_synced_id.as_deref(), Some("r0004"));
    assert_eq!(wm.last_synced_timestamp, Some(at(4)));
  }

  #[tokio::test]
  async fn test_touch_and_reset() {
    let tracker = tracker();
    tracker.advance(&receipt(1)).await.unwrap();
    tracker.touch_refresh_time(at(100)).await.unwrap();

    let wm = tracker.read().await.unwrap();
    assert_eq!(wm.last_refresh_time, Some(at(100)));
    assert_eq!(wm.last_synced_timestamp, Some(at(1)));

    tracker.reset().await.unwrap();
    assert_eq!(tracker.read().await.unwrap(), Watermark::default());
  }

  #[test]
  fn test_staleness() {
    let window = Duration::from_secs(3600);
    let mut wm = Watermark::default();
    assert!(wm.is_stale(at(0), window));

    wm.last_refresh_time = Some(at(0));
    assert!(!wm.is_stale(at(3600), window));
    assert!(wm.is_stale(at(3601), window));
  }

  #[test]
  fn test_latest_scans_everything() {
    let records = vec![receipt(3), receipt(9), receipt(1)];
    assert_eq!(latest(&records).and_then(|r| r.id.as_deref()), Some("r0009"));
    assert!(latest(&[]).is_none());
  }
}
