//! Document-store REST client.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::client::{Direction, Filter, ListQuery, ListResponse, RemoteClient};
use crate::config::{Config, RemoteConfig};
use crate::error::FetchError;
use crate::model::Receipt;

/// Lists receipts from a document collection over HTTP.
#[derive(Clone)]
pub struct HttpRemoteClient {
  http: reqwest::Client,
  documents_url: Url,
  project: String,
  api_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiDocumentList {
  total: u64,
  documents: Vec<Receipt>,
}

impl HttpRemoteClient {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;

    let base = Url::parse(config.endpoint.trim_end_matches('/'))
      .map_err(|e| eyre!("Invalid remote endpoint {}: {}", config.endpoint, e))?;
    let documents_url = Url::parse(&format!(
      "{}/databases/{}/collections/{}/documents",
      base.as_str().trim_end_matches('/'),
      config.database,
      config.collection
    ))
    .map_err(|e| eyre!("Invalid collection path: {}", e))?;

    let http = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      documents_url,
      project: config.project.clone(),
      api_key,
    })
  }
}

/// Encode a page request as the collection API's JSON query strings.
fn encode_queries(query: &ListQuery) -> Vec<String> {
  let mut queries = Vec::new();

  for filter in &query.filters {
    let q = match filter {
      Filter::Equal { field, value } => json!({
        "method": "equal",
        "attribute": field,
        "values": [value],
      }),
      Filter::GreaterThan { field, value } => json!({
        "method": "greaterThan",
        "attribute": field,
        "values": [value],
      }),
    };
    queries.push(q.to_string());
  }

  if let Some(sort) = &query.sort {
    let method = match sort.direction {
      Direction::Ascending => "orderAsc",
      Direction::Descending => "orderDesc",
    };
    queries.push(json!({ "method": method, "attribute": sort.field }).to_string());
  }

  queries.push(json!({ "method": "limit", "values": [query.limit] }).to_string());
  queries.push(json!({ "method": "offset", "values": [query.offset] }).to_string());

  queries
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
  async fn list(&self, query: &ListQuery) -> Result<ListResponse, FetchError> {
    let params: Vec<(&str, String)> = encode_queries(query)
      .into_iter()
      .map(|q| ("queries[]", q))
      .collect();

    debug!(offset = query.offset, limit = query.limit, "listing documents");

    let response = self
      .http
      .get(self.documents_url.clone())
      .header("X-Appwrite-Project", &self.project)
      .header("X-Appwrite-Key", &self.api_key)
      .query(&params)
      .send()
      .await
      .map_err(|e| FetchError::Remote(format!("request failed: {}", e)))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
      return Err(FetchError::RateLimited);
    }
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(FetchError::Remote(format!("HTTP {}: {}", status, body)));
    }

    let list: ApiDocumentList = response
      .json()
      .await
      .map_err(|e| FetchError::Remote(format!("failed to parse document list: {}", e)))?;

    Ok(ListResponse {
      items: list.documents,
      total: list.total,
    })
  }
}
