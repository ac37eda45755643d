//! Synchronization engine: decides how to refresh the mirror and rebuilds aggregates.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fetcher::PaginatedFetcher;
use super::watermark::{latest, Watermark, WatermarkTracker};
use super::{decide, Progress, SyncDecision};
use crate::aggregate::{aggregate, CustomerAggregate, GroupKey};
use crate::cache::CacheStorage;
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncResult};
use crate::model::{Receipt, TIMESTAMP_FIELD};
use crate::remote::{RemoteClient, Sort};

/// Snapshot of what the local mirror currently holds.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
  pub records: usize,
  pub aggregates: usize,
  pub watermark: Watermark,
  pub refresh_needed: bool,
}

/// Keeps a local receipt cache in step with a remote collection.
///
/// The store handle is acquired by the caller and handed over here for the
/// engine's lifetime; `shutdown` releases it. Concurrent calls against the
/// same engine are not coordinated.
pub struct SyncEngine<S: CacheStorage, R: RemoteClient> {
  storage: Arc<S>,
  remote: R,
  config: SyncConfig,
  watermark: WatermarkTracker<S>,
}

impl<S: CacheStorage, R: RemoteClient> SyncEngine<S, R> {
  pub fn new(storage: S, remote: R, config: SyncConfig) -> Self {
    let storage = Arc::new(storage);
    Self {
      watermark: WatermarkTracker::new(Arc::clone(&storage)),
      storage,
      remote,
      config,
    }
  }

  fn fetcher(&self) -> PaginatedFetcher<'_, R> {
    PaginatedFetcher::new(&self.remote, &self.config)
  }

  /// Current customer aggregates, refreshing from the remote when needed.
  pub async fn get_customer_aggregates(
    &self,
    progress: Progress<'_>,
  ) -> SyncResult<Vec<CustomerAggregate>> {
    let local = self.load_records().await?;
    let watermark = self.load_watermark().await?;

    progress("Checking for changes...", local.len());
    let remote_total = self.fetcher().remote_total(local.len(), progress).await?;

    let decision = decide(
      local.len(),
      remote_total,
      &watermark,
      Utc::now(),
      self.config.staleness_window,
    );
    info!(?decision, local = local.len(), remote = remote_total, "sync decision");

    match decision {
      SyncDecision::NoOp => {
        progress(&format!("Using {} cached receipts", local.len()), local.len());
        self.cached_aggregates(&local).await
      }
      SyncDecision::Delta { since } => match self.delta_sync(local, since, progress).await {
        Ok(aggregates) => Ok(aggregates),
        Err(e) => {
          warn!("delta sync failed, falling back to full fetch: {}", e);
          progress("Incremental sync failed, fetching everything...", 0);
          self.full_sync(progress).await
        }
      },
      SyncDecision::Full => self.full_sync(progress).await,
    }
  }

  /// Drop the watermark and refetch everything.
  pub async fn force_refresh(&self, progress: Progress<'_>) -> SyncResult<Vec<CustomerAggregate>> {
    info!("forced refresh");
    progress("Clearing sync state...", 0);
    self.watermark.reset().await?;
    self.full_sync(progress).await
  }

  /// Whether the next `get_customer_aggregates` would go to the remote regardless of counts.
  pub async fn is_refresh_needed(&self) -> bool {
    match self.watermark.read().await {
      Ok(wm) => !wm.is_present() || wm.is_stale(Utc::now(), self.config.staleness_window),
      Err(e) => {
        warn!("failed to read watermark: {}", e);
        true
      }
    }
  }

  /// Receipts of one (customer, store) group from the last aggregation. Never touches the remote.
  pub async fn get_receipt_history(&self, key: &GroupKey) -> SyncResult<Vec<Receipt>> {
    let aggregate = self
      .storage
      .get::<CustomerAggregate>(&key.storage_key())
      .await?;
    Ok(aggregate.map(|a| a.receipts).unwrap_or_default())
  }

  pub async fn status(&self) -> SyncResult<CacheStatus> {
    Ok(CacheStatus {
      records: self.storage.count::<Receipt>().await?,
      aggregates: self.storage.count::<CustomerAggregate>().await?,
      watermark: self.watermark.read().await?,
      refresh_needed: self.is_refresh_needed().await,
    })
  }

  /// Release the store. Every later operation fails with `NotInitialized`.
  pub fn shutdown(&self) {
    self.storage.close();
  }

  async fn load_records(&self) -> SyncResult<Vec<Receipt>> {
    match self.storage.get_all::<Receipt>().await {
      Ok(records) => Ok(records),
      Err(StoreError::NotInitialized) => Err(StoreError::NotInitialized.into()),
      Err(e) => {
        warn!("failed to read cached receipts, treating as empty: {}", e);
        Ok(Vec::new())
      }
    }
  }

  async fn load_watermark(&self) -> SyncResult<Watermark> {
    match self.watermark.read().await {
      Ok(wm) => Ok(wm),
      Err(StoreError::NotInitialized) => Err(StoreError::NotInitialized.into()),
      Err(e) => {
        warn!("failed to read watermark, treating as absent: {}", e);
        Ok(Watermark::default())
      }
    }
  }

  async fn delta_sync(
    &self,
    local: Vec<Receipt>,
    since: chrono::DateTime<Utc>,
    progress: Progress<'_>,
  ) -> SyncResult<Vec<CustomerAggregate>> {
    debug!(%since, local = local.len(), "delta sync");
    let known: HashSet<String> = local.iter().map(Receipt::key).collect();
    let fresh = self.fetcher().fetch_since(since, &known, progress).await?;

    if fresh.is_empty() {
      // Move the watermark up to what we hold so the same empty window isn't requeried
      if let Some(newest) = latest(&local) {
        self.watermark.advance(newest).await?;
      }
      self.watermark.touch_refresh_time(Utc::now()).await?;
      progress("No new receipts", local.len());
      return self.cached_aggregates(&local).await;
    }

    let added = fresh.len();
    self.storage.put(&fresh).await?;

    let mut merged = local;
    merged.extend(fresh);
    if let Some(newest) = latest(&merged) {
      self.watermark.advance(newest).await?;
    }
    self.watermark.touch_refresh_time(Utc::now()).await?;

    info!(added, total = merged.len(), "delta sync stored new receipts");
    progress(&format!("Added {} new receipts", added), merged.len());
    self.reconcile(&merged).await
  }

  async fn full_sync(&self, progress: Progress<'_>) -> SyncResult<Vec<CustomerAggregate>> {
    let sort = Sort::ascending(TIMESTAMP_FIELD);
    let records = self.fetcher().fetch_all(&[], Some(&sort), progress).await?;

    self.storage.replace(&records).await?;
    if let Some(last) = records.last() {
      self.watermark.advance(last).await?;
    }
    self.watermark.touch_refresh_time(Utc::now()).await?;

    info!(total = records.len(), "full sync replaced cached receipts");
    progress(&format!("Synced {} receipts", records.len()), records.len());
    self.reconcile(&records).await
  }

  /// Rebuild and persist aggregates from the complete record set.
  async fn reconcile(&self, records: &[Receipt]) -> SyncResult<Vec<CustomerAggregate>> {
    let aggregates = aggregate(records);
    match self.storage.replace(&aggregates).await {
      Ok(()) => debug!(groups = aggregates.len(), "aggregates persisted"),
      Err(StoreError::NotInitialized) => return Err(StoreError::NotInitialized.into()),
      Err(e) => warn!("failed to persist aggregates: {}", e),
    }
    Ok(aggregates)
  }

  async fn cached_aggregates(&self, local: &[Receipt]) -> SyncResult<Vec<CustomerAggregate>> {
    match self.storage.get_all::<CustomerAggregate>().await {
      Ok(aggregates) if !aggregates.is_empty() || local.is_empty() => Ok(aggregates),
      Ok(_) => {
        debug!("aggregate cache empty, rebuilding");
        self.reconcile(local).await
      }
      Err(StoreError::NotInitialized) => Err(StoreError::NotInitialized.into()),
      Err(e) => {
        warn!("failed to read cached aggregates, rebuilding: {}", e);
        self.reconcile(local).await
      }
    }
  }
}
