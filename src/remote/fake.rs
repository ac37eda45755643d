//! Scripted in-process remote used by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

use super::client::{Direction, Filter, ListQuery, ListResponse, RemoteClient};
use crate::error::FetchError;
use crate::model::{Receipt, TIMESTAMP_FIELD};

/// Which request an injected failure applies to.
#[derive(Debug, Clone, Copy)]
pub enum Trigger {
  /// A page request at this offset
  Offset(usize),
  /// Any request filtered by timestamp
  Delta,
  /// A single-row count request
  Count,
}

#[derive(Default)]
pub struct FakeRemote {
  records: Mutex<Vec<Receipt>>,
  calls: Mutex<Vec<ListQuery>>,
  failures: Mutex<VecDeque<(Trigger, FetchError)>>,
}

impl FakeRemote {
  pub fn with_records(records: Vec<Receipt>) -> Self {
    Self {
      records: Mutex::new(records),
      ..Default::default()
    }
  }

  pub fn push_records(&self, more: impl IntoIterator<Item = Receipt>) {
    self.records.lock().unwrap().extend(more);
  }

  /// Fail the next request matching `trigger` with `error`.
  pub fn fail_once(&self, trigger: Trigger, error: FetchError) {
    self.failures.lock().unwrap().push_back((trigger, error));
  }

  pub fn calls(&self) -> Vec<ListQuery> {
    self.calls.lock().unwrap().clone()
  }

  pub fn reset_calls(&self) {
    self.calls.lock().unwrap().clear();
  }

  /// Requests that fetched records, as opposed to count-only requests.
  pub fn page_calls(&self) -> Vec<ListQuery> {
    self.calls().into_iter().filter(|q| q.limit > 1).collect()
  }

  fn take_failure(&self, query: &ListQuery) -> Option<FetchError> {
    let mut failures = self.failures.lock().unwrap();
    let is_delta = query
      .filters
      .iter()
      .any(|f| matches!(f, Filter::GreaterThan { .. }));
    let pos = failures.iter().position(|(trigger, _)| match trigger {
      Trigger::Offset(offset) => query.limit > 1 && query.offset == *offset,
      Trigger::Delta => is_delta,
      Trigger::Count => query.limit == 1,
    })?;
    failures.remove(pos).map(|(_, e)| e)
  }
}

fn threshold(filter: &Filter) -> Option<DateTime<Utc>> {
  match filter {
    Filter::GreaterThan { field, value } if field == TIMESTAMP_FIELD => value
      .as_str()
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|dt| dt.with_timezone(&Utc)),
    _ => None,
  }
}

#[async_trait]
impl RemoteClient for FakeRemote {
  async fn list(&self, query: &ListQuery) -> Result<ListResponse, FetchError> {
    self.calls.lock().unwrap().push(query.clone());

    if let Some(error) = self.take_failure(query) {
      return Err(error);
    }

    let mut matching: Vec<Receipt> = self
      .records
      .lock()
      .unwrap()
      .iter()
      .filter(|r| {
        query
          .filters
          .iter()
          .filter_map(threshold)
          .all(|t| r.created_at > t)
      })
      .cloned()
      .collect();

    if let Some(sort) = &query.sort {
      matching.sort_by_key(|r| r.created_at);
      if sort.direction == Direction::Descending {
        matching.reverse();
      }
    }

    let total = matching.len() as u64;
    let items = matching
      .into_iter()
      .skip(query.offset)
      .take(query.limit)
      .collect();

    Ok(ListResponse { items, total })
  }
}
