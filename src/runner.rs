//! Process bootstrap: environment variables, build version, diagnostics
//! listener, and the plugin-registration hook.
use std::sync::Arc;

use axum::{Json, Router, routing::get};
use eyre::{Result, WrapErr, eyre};

use crate::{
    adapters::kv_store::MemoryKVStore,
    metrics,
    ports::kv_store::KVStore,
    tracing_setup,
};

/// Required environment variable naming the configuration KV store endpoint.
pub const KV_STORE_URL_ENV: &str = "XAVI_KVSTORE_URL";
/// Optional environment variable naming the diagnostics bind address.
pub const PPROF_ENDPOINT_ENV: &str = "XAVI_PPROF_ENDPOINT";

/// Hook invoked before any configuration is read; registrations of plugins
/// and custom health checks happen here.
pub type PluginRegistrationFn = fn();

/// The build version baked in at compile time, falling back to the crate
/// version.
pub fn build_version() -> &'static str {
    option_env!("XAVI_BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Obtain the configuration store named by `XAVI_KVSTORE_URL`. Absence of
/// the variable is fatal to bootstrap.
pub async fn kv_store_from_env() -> Result<Arc<dyn KVStore>> {
    let endpoint = std::env::var(KV_STORE_URL_ENV).map_err(|_| {
        eyre!("required environment variable {KV_STORE_URL_ENV} for configuration KV store must be specified")
    })?;

    tracing::info!(endpoint = %endpoint, "obtaining handle to KV store");
    let store = MemoryKVStore::open(&endpoint)
        .await
        .wrap_err_with(|| format!("failed to open KV store at {endpoint}"))?;
    Ok(Arc::new(store))
}

/// Fire up the diagnostics endpoint if indicated by the environment.
/// Returns true when a listener was attempted, false otherwise.
pub fn spawn_diagnostics_listener() -> bool {
    let endpoint = match std::env::var(PPROF_ENDPOINT_ENV) {
        Ok(e) if !e.is_empty() => e,
        _ => {
            tracing::info!("profiling endpoint not enabled - {PPROF_ENDPOINT_ENV} not specified");
            return false;
        }
    };

    tracing::info!(endpoint = %endpoint, "starting diagnostics listener");
    tokio::spawn(async move {
        let app = Router::new().route(
            "/debug/vars",
            get(|| async { Json(metrics::endpoint_gauge_snapshot()) }),
        );

        match tokio::net::TcpListener::bind(&endpoint).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "diagnostics listener failed");
                }
            }
            Err(e) => tracing::error!(endpoint = %endpoint, error = %e, "failed to bind diagnostics listener"),
        }
    });

    true
}

/// Initialize logging and metrics, run the plugin-registration hook, and
/// obtain the configuration store. Fatal errors surface to the caller and
/// exit the process non-zero.
pub async fn bootstrap(plugin_registration: Option<PluginRegistrationFn>) -> Result<Arc<dyn KVStore>> {
    tracing_setup::init_tracing(tracing_setup::logging_level_from_env())?;
    tracing::info!(version = build_version(), "xavi starting");

    metrics::init_metrics();
    spawn_diagnostics_listener();

    if let Some(register) = plugin_registration {
        tracing::info!("registering plugins");
        register();
    }

    kv_store_from_env().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_version_is_set() {
        assert!(!build_version().is_empty());
    }

    // Single test so the env var mutations cannot race each other.
    #[tokio::test]
    async fn test_kv_store_from_env() {
        unsafe {
            std::env::remove_var(KV_STORE_URL_ENV);
        }
        let err = match kv_store_from_env().await {
            Err(e) => e,
            Ok(_) => panic!("expected kv_store_from_env to fail"),
        };
        assert!(err.to_string().contains(KV_STORE_URL_ENV));

        unsafe {
            std::env::set_var(KV_STORE_URL_ENV, "mem://");
        }
        let kvs = kv_store_from_env().await.unwrap();
        kvs.put("servers/s1", b"{}").await.unwrap();
        assert!(kvs.get("servers/s1").await.unwrap().is_some());
        unsafe {
            std::env::remove_var(KV_STORE_URL_ENV);
        }
    }
}
