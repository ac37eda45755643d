//! Per-(customer, store) summaries derived from the cached receipts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::{Cacheable, Partition};
use crate::model::Receipt;

pub const UNKNOWN_CUSTOMER: &str = "Unknown Customer";
pub const NO_STORE_NAME: &str = "No Store Name";

/// Grouping key, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
  pub customer: String,
  pub store: String,
}

impl GroupKey {
  pub fn new(customer: impl Into<String>, store: impl Into<String>) -> Self {
    Self {
      customer: customer.into(),
      store: store.into(),
    }
  }

  pub fn for_receipt(receipt: &Receipt) -> Self {
    Self::new(
      receipt.customer_name.as_deref().unwrap_or(UNKNOWN_CUSTOMER),
      receipt.store_name.as_deref().unwrap_or(NO_STORE_NAME),
    )
  }

  /// Storage key. A JSON array, so no field value can collide with another.
  pub fn storage_key(&self) -> String {
    serde_json::json!([self.customer, self.store]).to_string()
  }
}

/// All receipts of one customer at one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerAggregate {
  pub key: GroupKey,
  pub receipts: Vec<Receipt>,
  pub total: f64,
  pub count: usize,
}

impl Cacheable for CustomerAggregate {
  fn cache_key(&self) -> String {
    self.key.storage_key()
  }

  fn partition() -> Partition {
    Partition::Aggregates
  }
}

/// Group `records` by customer and store.
///
/// Output is sorted by store name; groups with the same store keep the
/// order in which they were first seen.
pub fn aggregate(records: &[Receipt]) -> Vec<CustomerAggregate> {
  let mut groups: Vec<CustomerAggregate> = Vec::new();
  let mut index: HashMap<GroupKey, usize> = HashMap::new();

  for receipt in records {
    let key = GroupKey::for_receipt(receipt);
    let slot = *index.entry(key.clone()).or_insert_with(|| {
      groups.push(CustomerAggregate {
        key,
        receipts: Vec::new(),
        total: 0.0,
        count: 0,
      });
      groups.len() - 1
    });

    let group = &mut groups[slot];
    group.total += receipt.amount();
    group.count += 1;
    group.receipts.push(receipt.clone());
  }

  // stable
  groups.sort_by(|a, b| a.key.store.cmp(&b.key.store));
  groups
}
