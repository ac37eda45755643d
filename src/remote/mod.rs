//! Remote receipt collection: the listing interface and its HTTP implementation.

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod http;

pub use client::{Direction, Filter, ListQuery, ListResponse, RemoteClient, Sort};
pub use http::HttpRemoteClient;
