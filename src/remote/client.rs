//! Interface to the remote receipt collection.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::FetchError;
use crate::model::Receipt;

/// Filter predicate applied by the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  Equal { field: String, value: Value },
  GreaterThan { field: String, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
  pub field: String,
  pub direction: Direction,
}

impl Sort {
  pub fn ascending(field: &str) -> Self {
    Self {
      field: field.to_string(),
      direction: Direction::Ascending,
    }
  }
}

/// One page request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
  pub filters: Vec<Filter>,
  pub sort: Option<Sort>,
  pub limit: usize,
  pub offset: usize,
}

/// One page of results plus the total number of matching documents.
#[derive(Debug, Clone)]
pub struct ListResponse {
  pub items: Vec<Receipt>,
  pub total: u64,
}

/// A paginated, filterable, sortable document listing.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  async fn list(&self, query: &ListQuery) -> Result<ListResponse, FetchError>;
}

#[async_trait]
impl<R: RemoteClient + ?Sized> RemoteClient for Arc<R> {
  async fn list(&self, query: &ListQuery) -> Result<ListResponse, FetchError> {
    (**self).list(query).await
  }
}
