//! Offset pagination over the remote collection with rate-limit backoff.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::Progress;
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::FetchError;
use crate::model::{Receipt, TIMESTAMP_FIELD};
use crate::remote::{Filter, ListQuery, ListResponse, RemoteClient, Sort};

/// Drives a `RemoteClient` page by page.
pub struct PaginatedFetcher<'a, R: RemoteClient> {
  remote: &'a R,
  config: &'a SyncConfig,
}

impl<'a, R: RemoteClient> PaginatedFetcher<'a, R> {
  pub fn new(remote: &'a R, config: &'a SyncConfig) -> Self {
    Self { remote, config }
  }

  fn retry(&self) -> &RetryPolicy {
    &self.config.retry
  }

  /// Total number of documents on the remote. One `limit 1` request.
  ///
  /// `held` is what the caller already has locally; rate-limit waits report it.
  pub async fn remote_total(&self, held: usize, progress: Progress<'_>) -> Result<u64, FetchError> {
    let query = ListQuery {
      filters: Vec::new(),
      sort: None,
      limit: 1,
      offset: 0,
    };
    let response = self.with_retry(&query, held, progress).await?;
    Ok(response.total)
  }

  /// Fetch a single page. Rate limits are surfaced, not retried.
  ///
  /// Records without an identifier get their placeholder here.
  pub async fn fetch_page(&self, query: &ListQuery) -> Result<ListResponse, FetchError> {
    let response = self.remote.list(query).await?;
    Ok(ListResponse {
      items: response.items.into_iter().map(Receipt::with_identity).collect(),
      total: response.total,
    })
  }

  /// Page through everything matching `filters` until a short page comes back.
  ///
  /// Records are returned in fetch order, without repeated identifiers.
  pub async fn fetch_all(
    &self,
    filters: &[Filter],
    sort: Option<&Sort>,
    progress: Progress<'_>,
  ) -> Result<Vec<Receipt>, FetchError> {
    self.fetch_pages(filters, sort, 0, &|_: &Receipt| true, progress).await
  }

  /// Fetch records strictly newer than `since` whose keys are not in `known`.
  ///
  /// The remote query is widened by the configured buffer to tolerate
  /// timestamp precision skew; the exact cut is applied here. Progress counts
  /// start at `known.len()` and grow only with admitted records.
  pub async fn fetch_since(
    &self,
    since: DateTime<Utc>,
    known: &HashSet<String>,
    progress: Progress<'_>,
  ) -> Result<Vec<Receipt>, FetchError> {
    let buffer = chrono::Duration::from_std(self.config.delta_buffer)
      .unwrap_or_else(|_| chrono::Duration::zero());
    let lower = since - buffer;
    let filters = [Filter::GreaterThan {
      field: TIMESTAMP_FIELD.to_string(),
      value: Value::String(lower.to_rfc3339_opts(SecondsFormat::Millis, true)),
    }];
    let sort = Sort::ascending(TIMESTAMP_FIELD);

    let admit = |r: &Receipt| r.created_at > since && !known.contains(&r.key());
    let fresh = self
      .fetch_pages(&filters, Some(&sort), known.len(), &admit, progress)
      .await?;
    debug!(fresh = fresh.len(), %since, "delta window filtered");
    Ok(fresh)
  }

  async fn fetch_pages(
    &self,
    filters: &[Filter],
    sort: Option<&Sort>,
    base: usize,
    admit: &(dyn Fn(&Receipt) -> bool + Sync),
    progress: Progress<'_>,
  ) -> Result<Vec<Receipt>, FetchError> {
    let page_size = self.config.page_size.max(1);
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut offset = 0;

    progress("Fetching receipts...", base);

    loop {
      let query = ListQuery {
        filters: filters.to_vec(),
        sort: sort.cloned(),
        limit: page_size,
        offset,
      };
      let page = self.with_retry(&query, base + records.len(), progress).await?.items;
      let page_len = page.len();

      for record in page {
        if !admit(&record) {
          continue;
        }
        if seen.insert(record.key()) {
          records.push(record);
        } else {
          debug!(id = %record.key(), "dropping repeated record across pages");
        }
      }

      debug!(offset, page_len, accepted = records.len(), "fetched page");
      progress(&format!("Fetched {} receipts...", records.len()), base + records.len());

      if page_len < page_size {
        break;
      }
      offset += page_size;
      tokio::time::sleep(self.config.page_delay).await;
    }

    info!(count = records.len(), "fetch complete");
    progress(&format!("Fetched {} receipts", records.len()), base + records.len());
    Ok(records)
  }

  /// Issue `query`, waiting out rate limits up to the retry policy's bound.
  async fn with_retry(
    &self,
    query: &ListQuery,
    accepted: usize,
    progress: Progress<'_>,
  ) -> Result<ListResponse, FetchError> {
    let max_attempts = self.retry().max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match self.fetch_page(query).await {
        Err(e) if e.is_rate_limited() && attempt < max_attempts => {
          let delay = self.retry().backoff(attempt);
          warn!(
            offset = query.offset,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "rate limited, backing off"
          );
          progress(
            &format!("Rate limited, retrying in {}s...", delay.as_secs_f32()),
            accepted,
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) if e.is_rate_limited() => {
          return Err(FetchError::Remote(format!(
            "still rate limited after {} attempts at offset {}",
            max_attempts, query.offset
          )));
        }
        other => return other,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::fixtures::{at, receipt};
  use crate::remote::fake::{FakeRemote, Trigger};
  use crate::sync::fast_config;
  use std::sync::Mutex;

  fn no_progress(_: &str, _: usize) {}

  #[tokio::test]
  async fn test_fetch_all_pages_until_short_page() {
    let remote = FakeRemote::with_records((0..250).map(receipt).collect());
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let records = fetcher.fetch_all(&[], None, &no_progress).await.unwrap();

    assert_eq!(records.len(), 250);
    let offsets: Vec<usize> = remote.calls().iter().map(|q| q.offset).collect();
    assert_eq!(offsets, vec![0, 100, 200]);
  }

  #[tokio::test]
  async fn test_full_final_page_costs_one_empty_request() {
    let remote = FakeRemote::with_records((0..200).map(receipt).collect());
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let records = fetcher.fetch_all(&[], None, &no_progress).await.unwrap();

    assert_eq!(records.len(), 200);
    assert_eq!(remote.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_rate_limit_retries_same_offset() {
    let remote = FakeRemote::with_records((0..250).map(receipt).collect());
    remote.fail_once(Trigger::Offset(100), FetchError::RateLimited);
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let messages = Mutex::new(Vec::new());
    let progress = |msg: &str, _: usize| messages.lock().unwrap().push(msg.to_string());
    let records = fetcher.fetch_all(&[], None, &progress).await.unwrap();

    let offsets: Vec<usize> = remote.calls().iter().map(|q| q.offset).collect();
    assert_eq!(offsets, vec![0, 100, 100, 200]);
    assert_eq!(records.len(), 250);
    let keys: HashSet<String> = records.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), 250);
    assert!(messages
      .lock()
      .unwrap()
      .iter()
      .any(|m| m.starts_with("Rate limited")));
  }

  #[tokio::test]
  async fn test_rate_limit_is_bounded() {
    let remote = FakeRemote::with_records((0..10).map(receipt).collect());
    for _ in 0..5 {
      remote.fail_once(Trigger::Offset(0), FetchError::RateLimited);
    }
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let err = fetcher.fetch_all(&[], None, &no_progress).await.unwrap_err();

    assert!(matches!(err, FetchError::Remote(_)));
    assert_eq!(remote.calls().len(), 5);
  }

  #[tokio::test]
  async fn test_remote_error_aborts() {
    let remote = FakeRemote::with_records((0..250).map(receipt).collect());
    remote.fail_once(Trigger::Offset(100), FetchError::Remote("boom".into()));
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let err = fetcher.fetch_all(&[], None, &no_progress).await.unwrap_err();

    assert!(matches!(err, FetchError::Remote(_)));
    assert_eq!(remote.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_fetch_since_excludes_watermark_record() {
    let remote = FakeRemote::with_records((0..20).map(receipt).collect());
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let records = fetcher
      .fetch_since(at(15), &HashSet::new(), &no_progress)
      .await
      .unwrap();

    let ids: Vec<&str> = records.iter().filter_map(|r| r.id.as_deref()).collect();
    assert_eq!(ids, vec!["r0016", "r0017", "r0018", "r0019"]);

    // The remote was asked for one second earlier than the watermark
    let query = &remote.calls()[0];
    assert_eq!(
      query.filters,
      vec![Filter::GreaterThan {
        field: TIMESTAMP_FIELD.to_string(),
        value: Value::String("2024-01-01T00:00:14.000Z".to_string()),
      }]
    );
    assert_eq!(query.sort, Some(Sort::ascending(TIMESTAMP_FIELD)));
  }

  #[tokio::test]
  async fn test_fetch_since_counts_only_admitted_records() {
    let remote = FakeRemote::with_records((0..20).map(receipt).collect());
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);
    // r0017 is newer than the watermark but already held
    let known: HashSet<String> = (0..16).chain([17]).map(|n| receipt(n).key()).collect();

    let counts = Mutex::new(Vec::new());
    let progress = |_: &str, n: usize| counts.lock().unwrap().push(n);
    let records = fetcher.fetch_since(at(15), &known, &progress).await.unwrap();

    let ids: Vec<&str> = records.iter().filter_map(|r| r.id.as_deref()).collect();
    assert_eq!(ids, vec!["r0016", "r0018", "r0019"]);
    assert_eq!(*counts.lock().unwrap(), vec![17, 20, 20]);
  }

  #[tokio::test]
  async fn test_remote_total_uses_single_row_request() {
    let remote = FakeRemote::with_records((0..42).map(receipt).collect());
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    assert_eq!(fetcher.remote_total(0, &no_progress).await.unwrap(), 42);
    assert_eq!(remote.calls()[0].limit, 1);
  }

  #[tokio::test]
  async fn test_remote_total_reports_rate_limit_waits() {
    let remote = FakeRemote::with_records((0..42).map(receipt).collect());
    remote.fail_once(Trigger::Count, FetchError::RateLimited);
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let reports = Mutex::new(Vec::new());
    let progress = |msg: &str, n: usize| reports.lock().unwrap().push((msg.to_string(), n));
    let total = fetcher.remote_total(7, &progress).await.unwrap();

    assert_eq!(total, 42);
    assert_eq!(remote.calls().len(), 2);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].0.starts_with("Rate limited"));
    assert_eq!(reports[0].1, 7);
  }

  #[tokio::test]
  async fn test_fetch_page_assigns_placeholders() {
    let mut anonymous = receipt(3);
    anonymous.id = None;
    let remote = FakeRemote::with_records(vec![receipt(1), anonymous, receipt(5)]);
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let query = ListQuery {
      filters: Vec::new(),
      sort: None,
      limit: 2,
      offset: 1,
    };
    let page = fetcher.fetch_page(&query).await.unwrap();

    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert!(page.items[0]
      .id
      .as_deref()
      .is_some_and(|id| id.starts_with("local-")));
    assert_eq!(page.items[1].id.as_deref(), Some("r0005"));
  }

  #[tokio::test]
  async fn test_fetch_page_surfaces_rate_limit() {
    let remote = FakeRemote::with_records((0..10).map(receipt).collect());
    remote.fail_once(Trigger::Offset(0), FetchError::RateLimited);
    let config = fast_config();
    let fetcher = PaginatedFetcher::new(&remote, &config);

    let query = ListQuery {
      filters: Vec::new(),
      sort: None,
      limit: 5,
      offset: 0,
    };
    let err = fetcher.fetch_page(&query).await.unwrap_err();

    assert!(err.is_rate_limited());
    assert_eq!(remote.calls().len(), 1);
  }
}
