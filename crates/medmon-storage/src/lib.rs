//! Persistence (SQLite store) and HTTP fetch utilities for the media monitor.

mod http;
mod store;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use store::{decode_timestamp, encode_timestamp, Store, StoreConfig, StoreError};

pub const CRATE_NAME: &str = "medmon-storage";
