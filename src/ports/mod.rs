pub mod http_client;
pub mod kv_store;

pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use kv_store::{KVStore, KVStoreError};
