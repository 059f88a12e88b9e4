use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a key/value store collaborator.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KVStoreError {
    /// The store could not be reached or the operation failed mid-flight.
    #[error("kv store I/O error: {0}")]
    Io(String),

    /// The store endpoint handed to the process could not be understood.
    #[error("unsupported kv store endpoint: {0}")]
    UnsupportedEndpoint(String),
}

/// KVStore defines the port for the configuration store the gateway reads
/// its definitions from.
///
/// Keys follow the hierarchy `listeners/<name>`, `routes/<name>`,
/// `backends/<name>`, `servers/<name>`. Values are opaque record encodings;
/// the typed view lives in [`crate::config`].
///
/// The data plane only ever calls `get` and `list`; `put` exists for the
/// CLI CRUD surface.
#[async_trait]
pub trait KVStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVStoreError>;

    /// List every key beginning with `prefix`. Full keys are returned.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KVStoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KVStoreError>;
}
