//! Health-check primitives: probe functions and the custom-check registry.
//!
//! A health check is a function producing a lazy stream of boolean verdicts
//! for one endpoint; the channel is closed when the endpoint is torn down.
//! Operators may register a custom function per server name at bootstrap;
//! the engine resolves the custom function first and falls back to the
//! default HTTP probe built from the server definition.
use std::{sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    config::models::{ConfigError, ServerConfig, read_server_config},
    ports::{http_client::HttpClient, kv_store::KVStore},
};

/// Errors surfaced by custom health-check registration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HealthCheckError {
    /// Attempt to register a missing health-check function.
    #[error("no health check function provided")]
    NoHealthCheckFn,

    /// Custom health check registered for a server name absent from the
    /// current configuration.
    #[error("no server named '{0}' in the current configuration")]
    NoSuchServer(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A probe producing boolean verdicts for one endpoint at the cadence it
/// chooses. Receives the endpoint connect address and the transport to probe
/// with; the returned channel closes when the probe is torn down.
pub type HealthCheckFn =
    Arc<dyn Fn(&str, Arc<dyn HttpClient>) -> mpsc::Receiver<bool> + Send + Sync>;

/// Build the default probe for a server definition: GET
/// `http(s)://<address><ping_uri>` every `health_check_interval_ms`, where a
/// 2xx within `health_check_timeout_ms` yields `true` and any other outcome
/// yields `false`. Probe errors are folded into `false` verdicts.
pub fn default_health_check(server: &ServerConfig) -> HealthCheckFn {
    let protocol = server.ping_protocol;
    let ping_uri = server.ping_uri.clone();
    let interval = Duration::from_millis(server.health_check_interval_ms.max(1));
    let timeout = Duration::from_millis(server.health_check_timeout_ms.max(1));

    Arc::new(move |address: &str, client: Arc<dyn HttpClient>| {
        let ping_url = format!("{protocol}://{address}{ping_uri}");
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let verdict = client
                    .health_check(&ping_url, timeout)
                    .await
                    .unwrap_or(false);
                if tx.send(verdict).await.is_err() {
                    // Receiver dropped: the endpoint was torn down.
                    tracing::debug!(url = %ping_url, "health probe stopped");
                    break;
                }
            }
        });

        rx
    })
}

/// Registry of custom health checks keyed by server name.
///
/// Writes happen during bootstrap (before any load balancer is built),
/// reads at load-balancer build time.
#[derive(Default)]
pub struct HealthCheckRegistry {
    checks: scc::HashMap<String, HealthCheckFn>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom health check for the named server. The server must
    /// exist in the supplied configuration store.
    pub async fn register_for_server(
        &self,
        kvs: &dyn KVStore,
        server_name: &str,
        check: Option<HealthCheckFn>,
    ) -> Result<(), HealthCheckError> {
        let check = check.ok_or(HealthCheckError::NoHealthCheckFn)?;

        if read_server_config(server_name, kvs).await?.is_none() {
            return Err(HealthCheckError::NoSuchServer(server_name.to_string()));
        }

        let _ = self.checks.remove_async(server_name).await;
        let _ = self.checks.insert_async(server_name.to_string(), check).await;
        tracing::info!(server = %server_name, "registered custom health check");
        Ok(())
    }

    /// Look up the registered health check for a server name.
    pub fn for_server(&self, server_name: &str) -> Option<HealthCheckFn> {
        self.checks.read_sync(server_name, |_, check| check.clone())
    }

    /// Resolve the probe for a server: the registered custom function if
    /// present, otherwise the default probe.
    pub fn resolve(&self, server: &ServerConfig) -> HealthCheckFn {
        self.for_server(&server.name)
            .unwrap_or_else(|| default_health_check(server))
    }
}

static DEFAULT_REGISTRY: Lazy<HealthCheckRegistry> = Lazy::new(HealthCheckRegistry::new);

/// The process-wide registry written by the plugin-registration hook.
pub fn default_registry() -> &'static HealthCheckRegistry {
    &DEFAULT_REGISTRY
}

/// Register a custom health check for a server in the process-wide registry.
pub async fn register_health_check_for_server(
    kvs: &dyn KVStore,
    server_name: &str,
    check: Option<HealthCheckFn>,
) -> Result<(), HealthCheckError> {
    DEFAULT_REGISTRY
        .register_for_server(kvs, server_name, check)
        .await
}

/// Look up a custom health check in the process-wide registry.
pub fn health_check_for_server(server_name: &str) -> Option<HealthCheckFn> {
    DEFAULT_REGISTRY.for_server(server_name)
}
