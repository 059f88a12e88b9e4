//! Health-check engine: one probe and one feedback loop per endpoint.
//!
//! The engine resolves each endpoint's probe (custom registration first,
//! default HTTP probe otherwise), consumes its verdict stream, and feeds
//! state transitions back into the owning load balancer. Equal verdicts are
//! ignored so a flapping-free endpoint produces no log or gauge traffic.
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    config::models::ServerConfig,
    core::{
        health_check::{HealthCheckRegistry, default_registry},
        load_balancer::LoadBalancer,
        service::ManagedService,
    },
    ports::http_client::HttpClient,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownToken},
};

/// Spawns and supervises endpoint probes for the load balancers of a
/// service. A disabled engine spawns nothing, which keeps pure
/// selection-logic tests quiet.
pub struct HealthCheckEngine {
    http_client: Option<Arc<dyn HttpClient>>,
    registry: Option<Arc<HealthCheckRegistry>>,
    token: ShutdownToken,
    ca_clients: scc::HashMap<String, Arc<dyn HttpClient>>,
}

impl HealthCheckEngine {
    /// Create an engine probing through `http_client`, consulting the
    /// process-wide custom-check registry.
    pub fn new(http_client: Arc<dyn HttpClient>, shutdown: &GracefulShutdown) -> Self {
        Self {
            http_client: Some(http_client),
            registry: None,
            token: shutdown.shutdown_token(),
            ca_clients: scc::HashMap::new(),
        }
    }

    /// Create an engine with an explicit registry instance.
    pub fn with_registry(
        http_client: Arc<dyn HttpClient>,
        registry: Arc<HealthCheckRegistry>,
        shutdown: &GracefulShutdown,
    ) -> Self {
        Self {
            http_client: Some(http_client),
            registry: Some(registry),
            token: shutdown.shutdown_token(),
            ca_clients: scc::HashMap::new(),
        }
    }

    /// An engine that never probes.
    pub fn disabled() -> Self {
        Self {
            http_client: None,
            registry: None,
            token: GracefulShutdown::new().shutdown_token(),
            ca_clients: scc::HashMap::new(),
        }
    }

    fn resolve(&self, server: &ServerConfig) -> crate::core::health_check::HealthCheckFn {
        match &self.registry {
            Some(registry) => registry.resolve(server),
            None => default_registry().resolve(server),
        }
    }

    /// The transport used to probe a backend: the base client, or one with
    /// the backend's CA trust root layered in. Built adapters are cached per
    /// path; a failed build logs and falls back to the base client.
    fn client_for(&self, ca_cert_path: Option<&str>) -> Option<Arc<dyn HttpClient>> {
        let base = self.http_client.clone()?;
        let Some(path) = ca_cert_path else {
            return Some(base);
        };

        if let Some(cached) = self.ca_clients.read_sync(path, |_, c| c.clone()) {
            return Some(cached);
        }

        match crate::adapters::http_client::HttpClientAdapter::with_ca_cert(path) {
            Ok(adapter) => {
                let client: Arc<dyn HttpClient> = Arc::new(adapter);
                let _ = self.ca_clients.insert_sync(path.to_string(), client.clone());
                Some(client)
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to build CA transport, using base client");
                Some(base)
            }
        }
    }

    /// Spawn probes for every endpoint of every route in the service.
    pub fn watch_service(&self, service: &ManagedService) {
        for route in service.routes() {
            self.watch_endpoints(
                route.load_balancer.clone(),
                &route.servers,
                route.ca_cert_path.as_deref(),
            );
        }
    }

    /// Spawn one probe and one feedback loop per server in the pool.
    pub fn watch_endpoints(
        &self,
        load_balancer: Arc<dyn LoadBalancer>,
        servers: &[ServerConfig],
        ca_cert_path: Option<&str>,
    ) {
        let Some(client) = self.client_for(ca_cert_path) else {
            return;
        };

        for server in servers {
            let address = server.connect_address();
            tracing::info!(address = %address, server = %server.name, "spawning health check");

            let check = self.resolve(server);
            let verdicts = check(&address, client.clone());
            tokio::spawn(run_feedback_loop(
                load_balancer.clone(),
                address,
                verdicts,
                self.token.clone(),
            ));
        }
    }
}

/// Per-endpoint state machine: apply each verdict that differs from the
/// current state, ignore the rest. Exits on shutdown or when the probe
/// closes its stream; dropping the receiver stops the probe in turn.
async fn run_feedback_loop(
    load_balancer: Arc<dyn LoadBalancer>,
    address: String,
    mut verdicts: mpsc::Receiver<bool>,
    mut token: ShutdownToken,
) {
    let mut up = true;
    loop {
        tokio::select! {
            _ = token.wait_for_shutdown() => break,
            verdict = verdicts.recv() => {
                let Some(verdict) = verdict else { break };
                if verdict == up {
                    continue;
                }
                up = verdict;

                let result = if verdict {
                    load_balancer.mark_endpoint_up(&address)
                } else {
                    load_balancer.mark_endpoint_down(&address)
                };
                if let Err(e) = result {
                    tracing::error!(address = %address, error = %e, "failed to apply health verdict");
                }
            }
        }
    }

    tracing::debug!(address = %address, "health check loop stopped");
}
