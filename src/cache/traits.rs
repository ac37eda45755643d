//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};

/// Named partitions of the local cache. Each maps to its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Mirrored receipts, keyed by receipt identifier
  Records,
  /// Derived customer aggregates, keyed by grouping key
  Aggregates,
  /// Watermark and bookkeeping values, keyed by name
  Metadata,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::Records, Partition::Aggregates, Partition::Metadata];

  pub fn table(self) -> &'static str {
    match self {
      Partition::Records => "records",
      Partition::Aggregates => "aggregates",
      Partition::Metadata => "metadata",
    }
  }
}

/// Trait for values that can be cached.
///
/// Implementors declare the partition they live in and their primary key
/// within it.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Primary key within the partition (e.g., receipt id, metadata name)
  fn cache_key(&self) -> String;

  /// Partition this type is stored in
  fn partition() -> Partition;
}
