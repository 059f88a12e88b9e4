//! In-memory key/value store adapter.
//!
//! Backs the CLI and tests. With a `file://` endpoint the map is loaded at
//! open and flushed after every write, so definitions survive between CLI
//! invocations; `mem://` keeps everything process-local. Production
//! deployments plug in their own [`KVStore`] adapter.
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::ports::kv_store::{KVStore, KVStoreError};

/// Endpoint scheme for a process-local store.
pub const MEM_SCHEME: &str = "mem://";
/// Endpoint scheme for a file-backed store.
pub const FILE_SCHEME: &str = "file://";

#[derive(Default, Debug)]
pub struct MemoryKVStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    backing_file: Option<PathBuf>,
}

impl MemoryKVStore {
    /// Create an empty process-local store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store for the given endpoint URL (`mem://` or `file://<path>`).
    pub async fn open(endpoint: &str) -> Result<Self, KVStoreError> {
        if endpoint.starts_with(MEM_SCHEME) {
            return Ok(Self::new());
        }

        let Some(path) = endpoint.strip_prefix(FILE_SCHEME) else {
            return Err(KVStoreError::UnsupportedEndpoint(endpoint.to_string()));
        };

        let path = PathBuf::from(path);
        let mut entries = BTreeMap::new();
        if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| KVStoreError::Io(e.to_string()))?;
            let map: BTreeMap<String, String> = serde_json::from_slice(&bytes)
                .map_err(|e| KVStoreError::Io(format!("corrupt store file: {e}")))?;
            entries = map
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect();
        }

        tracing::info!(path = %path.display(), records = entries.len(), "opened file-backed kv store");
        Ok(Self {
            entries: RwLock::new(entries),
            backing_file: Some(path),
        })
    }

    async fn flush(&self) -> Result<(), KVStoreError> {
        let Some(path) = &self.backing_file else {
            return Ok(());
        };

        let snapshot: BTreeMap<String, String> = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .map(|(k, v)| {
                    String::from_utf8(v.clone())
                        .map(|s| (k.clone(), s))
                        .map_err(|_| KVStoreError::Io(format!("non-utf8 value under {k}")))
                })
                .collect::<Result<_, _>>()?
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| KVStoreError::Io(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| KVStoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl KVStore for MemoryKVStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVStoreError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KVStoreError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KVStoreError> {
        {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            entries.insert(key.to_string(), value.to_vec());
        }
        self.flush().await
    }
}
