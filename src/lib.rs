//! Local mirror of a remote receipt collection.
//!
//! The [`sync::SyncEngine`] keeps a SQLite-backed cache of receipts in step
//! with a paginated remote listing, preferring delta fetches bounded by a
//! persisted watermark, and derives per-(customer, store) aggregates from the
//! cached records.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod remote;
pub mod sync;

pub use aggregate::{CustomerAggregate, GroupKey};
pub use error::{FetchError, StoreError, SyncError};
pub use model::Receipt;
pub use sync::{Progress, SyncEngine};
