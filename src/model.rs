//! Receipt records as mirrored from the remote collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cache::{Cacheable, Partition};

/// Remote field holding the record timestamp. Used for filtering, sorting and the watermark.
pub const TIMESTAMP_FIELD: &str = "$createdAt";

/// Prefix of identifiers synthesized for records the remote sent without one.
pub const PLACEHOLDER_PREFIX: &str = "local-";

/// A single receipt document.
///
/// Only the fields the sync engine reasons about are typed; everything else
/// the remote sends is kept in `extra` so the cached copy round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
  #[serde(rename = "$id", default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(rename = "$createdAt")]
  pub created_at: DateTime<Utc>,
  #[serde(rename = "customerName", default)]
  pub customer_name: Option<String>,
  #[serde(rename = "storeName", default)]
  pub store_name: Option<String>,
  /// Monetary total. Not trusted to be numeric.
  #[serde(default)]
  pub total: Value,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Receipt {
  /// Identifier used as the cache key.
  ///
  /// Records without a remote id get a placeholder derived from their content,
  /// so the same logical record maps to the same key on every run.
  pub fn key(&self) -> String {
    match &self.id {
      Some(id) => id.clone(),
      None => self.placeholder_id(),
    }
  }

  /// Fill in a placeholder id if the remote did not send one.
  pub fn with_identity(mut self) -> Self {
    if self.id.is_none() {
      self.id = Some(self.placeholder_id());
    }
    self
  }

  fn placeholder_id(&self) -> String {
    // serde_json maps are sorted, so this encoding is canonical
    let bytes = serde_json::to_vec(&Receipt {
      id: None,
      ..self.clone()
    })
    .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{}{}", PLACEHOLDER_PREFIX, hex::encode(hasher.finalize()))
  }

  /// Total coerced to a number. Absent, non-numeric or non-finite totals count as zero.
  pub fn amount(&self) -> f64 {
    let value = match &self.total {
      Value::Number(n) => n.as_f64(),
      Value::String(s) => s.trim().parse::<f64>().ok(),
      _ => None,
    };
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
  }
}

impl Cacheable for Receipt {
  fn cache_key(&self) -> String {
    self.key()
  }

  fn partition() -> Partition {
    Partition::Records
  }
}
