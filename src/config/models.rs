//! Typed configuration records for the gateway.
//!
//! Records are immutable once loaded. They are stored as JSON values in the
//! key/value collaborator under the hierarchy `listeners/<name>`,
//! `routes/<name>`, `backends/<name>`, `servers/<name>`; the typed view here
//! is the only one the data plane consumes.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ports::kv_store::{KVStore, KVStoreError};

/// Key prefix for server definitions.
pub const SERVERS_PREFIX: &str = "servers/";
/// Key prefix for backend definitions.
pub const BACKENDS_PREFIX: &str = "backends/";
/// Key prefix for route definitions.
pub const ROUTES_PREFIX: &str = "routes/";
/// Key prefix for listener definitions.
pub const LISTENERS_PREFIX: &str = "listeners/";

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    10_000
}

/// Errors raised while reading configuration records during service
/// assembly. Lookup misses are distinct taxonomic values so callers can
/// tell which level of the listener → route → backend → server chain was
/// missing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("listener config '{0}' not found")]
    ListenerNotFound(String),

    #[error("route config '{0}' not found")]
    RouteNotFound(String),

    #[error("backend config '{0}' not found")]
    BackendNotFound(String),

    #[error("server config '{0}' not found")]
    ServerNotFound(String),

    #[error("plugin '{0}' not registered")]
    PluginNotFound(String),

    #[error("malformed record under {key}: {message}")]
    MalformedRecord { key: String, message: String },

    #[error(transparent)]
    Store(#[from] KVStoreError),

    #[error(transparent)]
    LoadBalancer(#[from] crate::core::load_balancer::LoadBalancerError),
}

/// Protocol used for health probes against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingProtocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for PingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingProtocol::Http => write!(f, "http"),
            PingProtocol::Https => write!(f, "https"),
        }
    }
}

/// Definition of a single upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Path probed by the health-check engine, e.g. `/health`.
    #[serde(default)]
    pub ping_uri: String,
    #[serde(default)]
    pub ping_protocol: PingProtocol,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

impl ServerConfig {
    /// The `host:port` connect address for this server.
    pub fn connect_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A named pool of upstream servers plus a load-balancing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub server_names: Vec<String>,
    /// Policy name resolved by the load-balancer factory. Empty selects the
    /// default (round-robin).
    #[serde(default)]
    pub load_balancer_policy: String,
    /// Optional PEM file added to the trust roots for this backend.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// URI-prefix match plus a plugin chain plus a target backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub uri_root: String,
    pub backend_name: String,
    #[serde(default)]
    pub plugin_names: Vec<String>,
    #[serde(default)]
    pub msg_properties: Option<String>,
}

/// A bound network address serving one or more routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub route_names: Vec<String>,
}

async fn read_record<T: for<'de> Deserialize<'de>>(
    key: &str,
    kvs: &dyn KVStore,
) -> Result<Option<T>, ConfigError> {
    let Some(bytes) = kvs.get(key).await? else {
        return Ok(None);
    };

    let record = serde_json::from_slice(&bytes).map_err(|e| ConfigError::MalformedRecord {
        key: key.to_string(),
        message: e.to_string(),
    })?;

    Ok(Some(record))
}

async fn store_record<T: Serialize>(
    key: &str,
    record: &T,
    kvs: &dyn KVStore,
) -> Result<(), ConfigError> {
    let bytes = serde_json::to_vec(record).map_err(|e| ConfigError::MalformedRecord {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    kvs.put(key, &bytes).await?;
    Ok(())
}

/// Read the server definition named `name`, or `None` when absent.
pub async fn read_server_config(
    name: &str,
    kvs: &dyn KVStore,
) -> Result<Option<ServerConfig>, ConfigError> {
    read_record(&format!("{SERVERS_PREFIX}{name}"), kvs).await
}

/// Read the backend definition named `name`, or `None` when absent.
pub async fn read_backend_config(
    name: &str,
    kvs: &dyn KVStore,
) -> Result<Option<BackendConfig>, ConfigError> {
    read_record(&format!("{BACKENDS_PREFIX}{name}"), kvs).await
}

/// Read the route definition named `name`, or `None` when absent.
pub async fn read_route_config(
    name: &str,
    kvs: &dyn KVStore,
) -> Result<Option<RouteConfig>, ConfigError> {
    read_record(&format!("{ROUTES_PREFIX}{name}"), kvs).await
}

/// Read the listener definition named `name`, or `None` when absent.
pub async fn read_listener_config(
    name: &str,
    kvs: &dyn KVStore,
) -> Result<Option<ListenerConfig>, ConfigError> {
    read_record(&format!("{LISTENERS_PREFIX}{name}"), kvs).await
}

impl ServerConfig {
    /// Persist this record under `servers/<name>`.
    pub async fn store(&self, kvs: &dyn KVStore) -> Result<(), ConfigError> {
        store_record(&format!("{SERVERS_PREFIX}{}", self.name), self, kvs).await
    }
}

impl BackendConfig {
    /// Persist this record under `backends/<name>`.
    pub async fn store(&self, kvs: &dyn KVStore) -> Result<(), ConfigError> {
        store_record(&format!("{BACKENDS_PREFIX}{}", self.name), self, kvs).await
    }
}

impl RouteConfig {
    /// Persist this record under `routes/<name>`.
    pub async fn store(&self, kvs: &dyn KVStore) -> Result<(), ConfigError> {
        store_record(&format!("{ROUTES_PREFIX}{}", self.name), self, kvs).await
    }
}

impl ListenerConfig {
    /// Persist this record under `listeners/<name>`.
    pub async fn store(&self, kvs: &dyn KVStore) -> Result<(), ConfigError> {
        store_record(&format!("{LISTENERS_PREFIX}{}", self.name), self, kvs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::kv_store::MemoryKVStore;

    fn sample_server() -> ServerConfig {
        ServerConfig {
            name: "server1".to_string(),
            address: "localhost".to_string(),
            port: 3000,
            ping_uri: "/health".to_string(),
            ping_protocol: PingProtocol::Http,
            health_check_interval_ms: 100,
            health_check_timeout_ms: 50,
        }
    }

    #[test]
    fn test_connect_address() {
        assert_eq!(sample_server().connect_address(), "localhost:3000");
    }

    #[tokio::test]
    async fn test_store_then_read_round_trip() {
        let kvs = MemoryKVStore::new();
        let server = sample_server();
        server.store(&kvs).await.unwrap();

        let read = read_server_config("server1", &kvs).await.unwrap().unwrap();
        assert_eq!(read, server);
    }

    #[tokio::test]
    async fn test_read_missing_record_is_none() {
        let kvs = MemoryKVStore::new();
        assert!(read_listener_config("nope", &kvs).await.unwrap().is_none());
        assert!(read_route_config("nope", &kvs).await.unwrap().is_none());
        assert!(read_backend_config("nope", &kvs).await.unwrap().is_none());
        assert!(read_server_config("nope", &kvs).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_is_reported() {
        let kvs = MemoryKVStore::new();
        kvs.put("servers/broken", b"not json").await.unwrap();

        let err = read_server_config("broken", &kvs).await.unwrap_err();
        assert!(matches!(err, ConfigError::MalformedRecord { .. }));
    }

    #[tokio::test]
    async fn test_defaults_applied_on_sparse_record() {
        let kvs = MemoryKVStore::new();
        kvs.put(
            "servers/sparse",
            br#"{"name":"sparse","address":"localhost","port":8080}"#,
        )
        .await
        .unwrap();

        let server = read_server_config("sparse", &kvs).await.unwrap().unwrap();
        assert_eq!(server.ping_protocol, PingProtocol::Http);
        assert_eq!(server.health_check_interval_ms, 30_000);
        assert_eq!(server.health_check_timeout_ms, 10_000);
    }
}
