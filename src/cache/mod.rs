//! Local persistent cache for mirrored receipts.
//!
//! This module provides a domain-agnostic key-value store that:
//! - Keeps named partitions (`records`, `aggregates`, `metadata`), one table each
//! - Upserts by each value's declared primary key and preserves insertion order
//! - Replaces a partition wholesale inside a single transaction
//! - Versions its schema and clears data left by the legacy layout

mod storage;
mod traits;

pub use storage::{upgrade, CacheStorage, SqliteStorage, LEGACY_SCHEMA_VERSION, SCHEMA_VERSION};
pub use traits::{Cacheable, Partition};
