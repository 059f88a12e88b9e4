//! Load-balancing engine: endpoint pool, selection policies, up/down state.
//!
//! A load balancer owns an ordered set of endpoints whose membership never
//! changes after construction; only the `up` flag of each member mutates.
//! The pool and the selection cursor live behind a single mutex, so
//! selections are strictly serialized and a mark-up/down issued at time *t*
//! is observed by every subsequent selection on the same balancer.
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use thiserror::Error;

use crate::{config::models::ServerConfig, metrics::set_endpoint_status};

/// Errors surfaced by load-balancer construction and operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadBalancerError {
    #[error("expected non-empty backend name")]
    EmptyBackendName,

    #[error("expected at least one server in the pool")]
    EmptyServerList,

    #[error("all servers in backend {0} are marked down")]
    AllDown(String),

    #[error("expected connect address in host:port form, got '{0}'")]
    BadAddress(String),

    #[error("address not found in load balancing pool: {0}")]
    NotInPool(String),
}

/// One concrete upstream `host:port` inside a backend.
///
/// `address` is fixed at construction; `up` is mutated only by the
/// health-check engine or explicit mark-up/down calls, always under the
/// owning pool's mutex.
#[derive(Debug, Clone)]
pub struct LoadBalancerEndpoint {
    pub address: String,
    pub ping_uri: String,
    pub ca_cert_path: Option<String>,
    pub up: bool,
}

/// Capability set shared by every load-balancing policy.
pub trait LoadBalancer: Send + Sync {
    /// Return the connect address of the next healthy endpoint.
    fn get_connect_address(&self) -> Result<String, LoadBalancerError>;

    /// Mark the endpoint with the given connect address as up.
    fn mark_endpoint_up(&self, address: &str) -> Result<(), LoadBalancerError>;

    /// Mark the endpoint with the given connect address as down.
    fn mark_endpoint_down(&self, address: &str) -> Result<(), LoadBalancerError>;

    /// Snapshot of connect addresses partitioned into (healthy, unhealthy).
    fn get_endpoints(&self) -> (Vec<String>, Vec<String>);
}

#[derive(Debug)]
struct PoolState {
    endpoints: Vec<LoadBalancerEndpoint>,
    cursor: usize,
}

/// Endpoint collection shared by the policy implementations. Membership is
/// immutable after construction; all access goes through one mutex.
#[derive(Debug)]
struct EndpointPool {
    backend: String,
    state: Mutex<PoolState>,
}

impl EndpointPool {
    fn new(backend: &str, ca_cert_path: Option<&str>, servers: &[ServerConfig]) -> Self {
        let mut endpoints = Vec::with_capacity(servers.len());
        for server in servers {
            let address = server.connect_address();
            set_endpoint_status(&address, true);
            tracing::info!(address = %address, backend = %backend, "adding server to pool");
            endpoints.push(LoadBalancerEndpoint {
                address,
                ping_uri: server.ping_uri.clone(),
                ca_cert_path: ca_cert_path.map(str::to_string),
                up: true,
            });
        }

        Self {
            backend: backend.to_string(),
            state: Mutex::new(PoolState {
                endpoints,
                cursor: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, address: &str, up: bool) -> Result<(), LoadBalancerError> {
        if address.is_empty() || address.split(':').count() != 2 {
            return Err(LoadBalancerError::BadAddress(address.to_string()));
        }

        let mut state = self.lock();
        let endpoint = state
            .endpoints
            .iter_mut()
            .find(|e| e.address == address)
            .ok_or_else(|| LoadBalancerError::NotInPool(address.to_string()))?;
        endpoint.up = up;

        tracing::info!(address = %address, up, backend = %self.backend, "endpoint status changed");
        set_endpoint_status(address, up);
        Ok(())
    }

    fn partition(&self) -> (Vec<String>, Vec<String>) {
        let state = self.lock();
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for endpoint in &state.endpoints {
            if endpoint.up {
                healthy.push(endpoint.address.clone());
            } else {
                unhealthy.push(endpoint.address.clone());
            }
        }
        (healthy, unhealthy)
    }
}

/// Hands out connect addresses one after another in stable ring order,
/// skipping endpoints that are marked down.
pub struct RoundRobinLoadBalancer {
    pool: EndpointPool,
}

impl RoundRobinLoadBalancer {
    fn new(backend: &str, ca_cert_path: Option<&str>, servers: &[ServerConfig]) -> Self {
        Self {
            pool: EndpointPool::new(backend, ca_cert_path, servers),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn get_connect_address(&self) -> Result<String, LoadBalancerError> {
        let mut state = self.pool.lock();
        let len = state.endpoints.len();
        // One full revolution from the current cursor; the cursor advances
        // past down endpoints too.
        for _ in 0..len {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % len;
            if state.endpoints[idx].up {
                return Ok(state.endpoints[idx].address.clone());
            }
        }

        Err(LoadBalancerError::AllDown(self.pool.backend.clone()))
    }

    fn mark_endpoint_up(&self, address: &str) -> Result<(), LoadBalancerError> {
        self.pool.set_status(address, true)
    }

    fn mark_endpoint_down(&self, address: &str) -> Result<(), LoadBalancerError> {
        self.pool.set_status(address, false)
    }

    fn get_endpoints(&self) -> (Vec<String>, Vec<String>) {
        self.pool.partition()
    }
}

/// Picks a healthy endpoint uniformly at random.
pub struct RandomLoadBalancer {
    pool: EndpointPool,
}

impl RandomLoadBalancer {
    fn new(backend: &str, ca_cert_path: Option<&str>, servers: &[ServerConfig]) -> Self {
        Self {
            pool: EndpointPool::new(backend, ca_cert_path, servers),
        }
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn get_connect_address(&self) -> Result<String, LoadBalancerError> {
        let state = self.pool.lock();
        let up: Vec<&LoadBalancerEndpoint> =
            state.endpoints.iter().filter(|e| e.up).collect();
        if up.is_empty() {
            return Err(LoadBalancerError::AllDown(self.pool.backend.clone()));
        }

        let idx = rand::rng().random_range(0..up.len());
        Ok(up[idx].address.clone())
    }

    fn mark_endpoint_up(&self, address: &str) -> Result<(), LoadBalancerError> {
        self.pool.set_status(address, true)
    }

    fn mark_endpoint_down(&self, address: &str) -> Result<(), LoadBalancerError> {
        self.pool.set_status(address, false)
    }

    fn get_endpoints(&self) -> (Vec<String>, Vec<String>) {
        self.pool.partition()
    }
}

/// Name of the default selection policy.
pub const ROUND_ROBIN_POLICY: &str = "round-robin";
/// Name of the random selection policy.
pub const RANDOM_POLICY: &str = "random";

/// Build a load balancer for `backend_name` over `servers`, selecting the
/// policy variant by name. An empty policy selects round-robin; an unknown
/// policy logs a warning and falls back to round-robin.
///
/// Every endpoint starts up and its gauge is set to 1. Probe spawning is the
/// health-check engine's job; see
/// [`crate::core::health_check::HealthCheckEngine::watch_endpoints`].
pub fn build_load_balancer(
    policy: &str,
    backend_name: &str,
    ca_cert_path: Option<&str>,
    servers: &[ServerConfig],
) -> Result<Arc<dyn LoadBalancer>, LoadBalancerError> {
    if backend_name.is_empty() {
        return Err(LoadBalancerError::EmptyBackendName);
    }
    if servers.is_empty() {
        return Err(LoadBalancerError::EmptyServerList);
    }

    match policy {
        "" | ROUND_ROBIN_POLICY => Ok(Arc::new(RoundRobinLoadBalancer::new(
            backend_name,
            ca_cert_path,
            servers,
        ))),
        RANDOM_POLICY => Ok(Arc::new(RandomLoadBalancer::new(
            backend_name,
            ca_cert_path,
            servers,
        ))),
        other => {
            tracing::warn!(
                policy = %other,
                backend = %backend_name,
                "unknown load balancer policy, falling back to round-robin"
            );
            Ok(Arc::new(RoundRobinLoadBalancer::new(
                backend_name,
                ca_cert_path,
                servers,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, port: u16) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            address: "a".to_string(),
            port,
            ping_uri: "/ping".to_string(),
            ping_protocol: crate::config::PingProtocol::Http,
            health_check_interval_ms: 100,
            health_check_timeout_ms: 50,
        }
    }

    fn three_server_lb() -> Arc<dyn LoadBalancer> {
        let servers = vec![server("s1", 1), server("s2", 2), server("s3", 3)];
        build_load_balancer(ROUND_ROBIN_POLICY, "demo-backend", None, &servers).unwrap()
    }

    #[test]
    fn test_rejects_empty_backend_name() {
        let err = match build_load_balancer("round-robin", "", None, &[server("s1", 1)]) {
            Err(e) => e,
            Ok(_) => panic!("expected build_load_balancer to fail"),
        };
        assert_eq!(err, LoadBalancerError::EmptyBackendName);
    }

    #[test]
    fn test_rejects_empty_server_list() {
        let err = match build_load_balancer("round-robin", "demo-backend", None, &[]) {
            Err(e) => e,
            Ok(_) => panic!("expected build_load_balancer to fail"),
        };
        assert_eq!(err, LoadBalancerError::EmptyServerList);
    }

    #[test]
    fn test_round_robin_fairness() {
        let lb = three_server_lb();
        let picks: Vec<String> = (0..4).map(|_| lb.get_connect_address().unwrap()).collect();
        assert_eq!(picks, vec!["a:1", "a:2", "a:3", "a:1"]);
    }

    #[test]
    fn test_round_robin_skips_down_endpoint() {
        let lb = three_server_lb();
        lb.mark_endpoint_down("a:2").unwrap();

        let picks: Vec<String> = (0..3).map(|_| lb.get_connect_address().unwrap()).collect();
        assert_eq!(picks, vec!["a:1", "a:3", "a:1"]);
    }

    #[test]
    fn test_all_down_names_the_backend() {
        let lb = three_server_lb();
        for addr in ["a:1", "a:2", "a:3"] {
            lb.mark_endpoint_down(addr).unwrap();
        }

        let err = lb.get_connect_address().unwrap_err();
        assert_eq!(err, LoadBalancerError::AllDown("demo-backend".to_string()));
        assert!(err.to_string().contains("demo-backend"));
    }

    #[test]
    fn test_recovery_after_mark_up() {
        let lb = three_server_lb();
        for addr in ["a:1", "a:2", "a:3"] {
            lb.mark_endpoint_down(addr).unwrap();
        }
        lb.mark_endpoint_up("a:2").unwrap();

        assert_eq!(lb.get_connect_address().unwrap(), "a:2");
        // The sole healthy endpoint is returned on every call.
        assert_eq!(lb.get_connect_address().unwrap(), "a:2");
    }

    #[test]
    fn test_down_endpoint_never_returned_until_marked_up() {
        let lb = three_server_lb();
        lb.mark_endpoint_down("a:3").unwrap();
        for _ in 0..10 {
            assert_ne!(lb.get_connect_address().unwrap(), "a:3");
        }

        lb.mark_endpoint_up("a:3").unwrap();
        let picks: Vec<String> = (0..3).map(|_| lb.get_connect_address().unwrap()).collect();
        assert!(picks.contains(&"a:3".to_string()));
    }

    #[test]
    fn test_mark_rejects_bad_addresses() {
        let lb = three_server_lb();
        assert_eq!(
            lb.mark_endpoint_down("").unwrap_err(),
            LoadBalancerError::BadAddress(String::new())
        );
        assert_eq!(
            lb.mark_endpoint_up("no-port").unwrap_err(),
            LoadBalancerError::BadAddress("no-port".to_string())
        );
    }

    #[test]
    fn test_mark_rejects_unknown_address() {
        let lb = three_server_lb();
        assert_eq!(
            lb.mark_endpoint_down("a:9").unwrap_err(),
            LoadBalancerError::NotInPool("a:9".to_string())
        );
    }

    #[test]
    fn test_get_endpoints_partitions_by_status() {
        let lb = three_server_lb();
        lb.mark_endpoint_down("a:2").unwrap();

        let (healthy, unhealthy) = lb.get_endpoints();
        assert_eq!(healthy, vec!["a:1", "a:3"]);
        assert_eq!(unhealthy, vec!["a:2"]);
    }

    #[test]
    fn test_single_down_endpoint_pool() {
        let lb =
            build_load_balancer("round-robin", "lonely", None, &[server("s1", 1)]).unwrap();
        lb.mark_endpoint_down("a:1").unwrap();
        assert_eq!(
            lb.get_connect_address().unwrap_err(),
            LoadBalancerError::AllDown("lonely".to_string())
        );
    }

    #[test]
    fn test_random_policy_only_returns_healthy() {
        let servers = vec![server("s1", 1), server("s2", 2), server("s3", 3)];
        let lb = build_load_balancer(RANDOM_POLICY, "demo-backend", None, &servers).unwrap();
        lb.mark_endpoint_down("a:1").unwrap();
        lb.mark_endpoint_down("a:3").unwrap();

        for _ in 0..10 {
            assert_eq!(lb.get_connect_address().unwrap(), "a:2");
        }
    }

    #[test]
    fn test_unknown_policy_falls_back_to_round_robin() {
        let servers = vec![server("s1", 1), server("s2", 2)];
        let lb = build_load_balancer("least-astonishing", "demo-backend", None, &servers).unwrap();
        assert_eq!(lb.get_connect_address().unwrap(), "a:1");
        assert_eq!(lb.get_connect_address().unwrap(), "a:2");
    }

    #[test]
    fn test_selection_is_serialized_across_threads() {
        let lb = three_server_lb();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let lb = lb.clone();
            handles.push(std::thread::spawn(move || {
                let mut picks = Vec::new();
                for _ in 0..30 {
                    picks.push(lb.get_connect_address().unwrap());
                }
                picks
            }));
        }

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for pick in handle.join().unwrap() {
                *counts.entry(pick).or_insert(0usize) += 1;
            }
        }

        // 90 selections over 3 healthy endpoints in ring order: exact thirds.
        assert_eq!(counts.get("a:1"), Some(&30));
        assert_eq!(counts.get("a:2"), Some(&30));
        assert_eq!(counts.get("a:3"), Some(&30));
    }
}
