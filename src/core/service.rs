//! Service assembly: listener → routes → backends → load balancers.
//!
//! `build_service_for_listener` reads the listener definition and walks the
//! configuration chain, assembling one load balancer per route. The
//! resulting service exposes a dispatch entry point that matches the
//! request URI against the longest route prefix and forwards to the next
//! healthy endpoint of that route's backend.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode, Uri};

use crate::{
    config::models::{
        ConfigError, ServerConfig, read_backend_config, read_listener_config, read_route_config,
        read_server_config,
    },
    core::{
        load_balancer::{LoadBalancer, build_load_balancer},
        plugin::{DispatchError, RequestHandler, wrap_handler},
        timer::{Contributor, EndToEndTimer},
    },
    metrics,
    ports::{http_client::HttpClient, kv_store::KVStore},
};

/// The active timing contributor for a dispatch, carried through request
/// extensions so the forwarding handler can record service calls.
#[derive(Clone)]
pub struct ActiveContributor(pub Arc<Contributor>);

/// One assembled route: prefix match, plugin chain, and its load balancer.
pub struct ManagedRoute {
    pub name: String,
    pub uri_root: String,
    pub backend_name: String,
    pub plugin_names: Vec<String>,
    pub load_balancer: Arc<dyn LoadBalancer>,
    /// Server definitions backing the pool; the health-check engine reads
    /// these when it spawns probes.
    pub servers: Vec<ServerConfig>,
    pub ca_cert_path: Option<String>,
    handler: RequestHandler,
}

/// A runnable service bound to one listener.
pub struct ManagedService {
    pub listener_name: String,
    pub address: String,
    routes: Vec<ManagedRoute>,
}

/// Build a runnable service for the named listener, retrieving definitions
/// from the supplied store. Configuration lookup misses abort the build and
/// surface unchanged.
pub async fn build_service_for_listener(
    name: &str,
    address: &str,
    kvs: &dyn KVStore,
    http_client: Arc<dyn HttpClient>,
) -> Result<ManagedService, ConfigError> {
    tracing::info!(listener = %name, address = %address, "building service for listener");

    let listener = read_listener_config(name, kvs)
        .await?
        .ok_or_else(|| ConfigError::ListenerNotFound(name.to_string()))?;

    let mut routes = Vec::with_capacity(listener.route_names.len());
    for route_name in &listener.route_names {
        tracing::info!(route = %route_name, "reading route");
        routes.push(build_route(route_name, kvs, http_client.clone()).await?);
    }

    Ok(ManagedService {
        listener_name: name.to_string(),
        address: address.to_string(),
        routes,
    })
}

async fn build_route(
    name: &str,
    kvs: &dyn KVStore,
    http_client: Arc<dyn HttpClient>,
) -> Result<ManagedRoute, ConfigError> {
    let route = read_route_config(name, kvs)
        .await?
        .ok_or_else(|| ConfigError::RouteNotFound(name.to_string()))?;

    let backend = read_backend_config(&route.backend_name, kvs)
        .await?
        .ok_or_else(|| ConfigError::BackendNotFound(route.backend_name.clone()))?;

    let mut servers = Vec::with_capacity(backend.server_names.len());
    for server_name in &backend.server_names {
        let server = read_server_config(server_name, kvs)
            .await?
            .ok_or_else(|| ConfigError::ServerNotFound(server_name.clone()))?;
        servers.push(server);
    }

    let load_balancer = build_load_balancer(
        &backend.load_balancer_policy,
        &backend.name,
        backend.ca_cert_path.as_deref(),
        &servers,
    )?;

    let scheme = if backend.ca_cert_path.is_some() {
        "https"
    } else {
        "http"
    };
    let base = forward_handler(
        backend.name.clone(),
        scheme,
        load_balancer.clone(),
        http_client,
    );
    let handler = wrap_handler(base, &route.plugin_names)?;

    Ok(ManagedRoute {
        name: route.name,
        uri_root: route.uri_root,
        backend_name: backend.name,
        plugin_names: route.plugin_names,
        load_balancer,
        servers,
        ca_cert_path: backend.ca_cert_path,
        handler,
    })
}

/// The innermost handler of every route: select an endpoint, rewrite the
/// URI, and forward upstream, recording a service call on the active timing
/// contributor.
fn forward_handler(
    backend_name: String,
    scheme: &'static str,
    load_balancer: Arc<dyn LoadBalancer>,
    http_client: Arc<dyn HttpClient>,
) -> RequestHandler {
    Arc::new(move |mut req: Request<AxumBody>| {
        let backend_name = backend_name.clone();
        let load_balancer = load_balancer.clone();
        let http_client = http_client.clone();

        Box::pin(async move {
            let address = load_balancer.get_connect_address()?;
            tracing::debug!(address = %address, backend = %backend_name, "selected endpoint");

            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            let uri: Uri = format!("{scheme}://{address}{path_and_query}")
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| {
                    DispatchError::Transport(crate::ports::http_client::HttpClientError::InvalidRequest(
                        e.to_string(),
                    ))
                })?;
            *req.uri_mut() = uri;

            let call = req
                .extensions()
                .get::<ActiveContributor>()
                .map(|c| c.0.start_service_call(&backend_name, &address));

            match http_client.send_request(req).await {
                Ok(response) => {
                    if let Some(call) = call {
                        call.end(None);
                    }
                    Ok(response)
                }
                Err(e) => {
                    if let Some(call) = call {
                        call.end(Some(&e));
                    }
                    Err(DispatchError::Transport(e))
                }
            }
        })
    })
}

impl ManagedService {
    /// The assembled routes, in listener configuration order.
    pub fn routes(&self) -> &[ManagedRoute] {
        &self.routes
    }

    /// Longest-prefix match of the request path against the route table.
    pub fn find_route(&self, path: &str) -> Option<&ManagedRoute> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(&route.uri_root))
            .max_by_key(|route| route.uri_root.len())
    }

    /// Dispatch one request: prefix-match a route, run its plugin-wrapped
    /// handler, and map failures onto downstream status codes. Every
    /// dispatch records an end-to-end timer which is logged at completion.
    pub async fn dispatch(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        let path = req.uri().path().to_string();

        let Some(route) = self.find_route(&path) else {
            tracing::debug!(path = %path, "no route matched");
            return plain_response(StatusCode::NOT_FOUND, "no route matched");
        };

        let _request_timer = metrics::RequestTimer::new(&route.name);
        let timer = EndToEndTimer::new(&route.name);
        let contributor = timer.start_contributor(&route.backend_name);
        req.extensions_mut()
            .insert(ActiveContributor(contributor.clone()));

        let response = match (route.handler)(req).await {
            Ok(response) => {
                contributor.end(None);
                response
            }
            Err(DispatchError::Selection(e)) => {
                tracing::warn!(route = %route.name, error = %e, "no healthy endpoint");
                contributor.end(Some(&e));
                plain_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
            }
            Err(DispatchError::Transport(e)) => {
                tracing::error!(route = %route.name, error = %e, "upstream request failed");
                contributor.end(Some(&e));
                plain_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        };

        timer.stop(None);
        metrics::increment_request_total(&route.name, response.status().as_u16());
        tracing::info!(target: "timing", timing = %timer.to_json_string());

        response
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .body(AxumBody::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(AxumBody::empty()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        adapters::kv_store::MemoryKVStore,
        config::models::{BackendConfig, ListenerConfig, PingProtocol, RouteConfig},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    struct EchoingClient;

    #[async_trait]
    impl HttpClient for EchoingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Ok(Response::builder()
                .status(200)
                .header("x-upstream-uri", req.uri().to_string())
                .body(AxumBody::empty())
                .unwrap())
        }

        async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    struct FailingClient;

    #[async_trait]
    impl HttpClient for FailingClient {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::ConnectionError(
                "connection refused".to_string(),
            ))
        }

        async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<bool> {
            Ok(false)
        }
    }

    async fn seed_store(kvs: &MemoryKVStore) {
        for (name, port) in [("server1", 3000), ("server2", 3001)] {
            ServerConfig {
                name: name.to_string(),
                address: "localhost".to_string(),
                port,
                ping_uri: "/health".to_string(),
                ping_protocol: PingProtocol::Http,
                health_check_interval_ms: 50,
                health_check_timeout_ms: 20,
            }
            .store(kvs)
            .await
            .unwrap();
        }

        BackendConfig {
            name: "demo-backend".to_string(),
            server_names: vec!["server1".to_string(), "server2".to_string()],
            load_balancer_policy: "round-robin".to_string(),
            ca_cert_path: None,
        }
        .store(kvs)
        .await
        .unwrap();

        RouteConfig {
            name: "demo-route".to_string(),
            uri_root: "/api".to_string(),
            backend_name: "demo-backend".to_string(),
            plugin_names: vec![],
            msg_properties: None,
        }
        .store(kvs)
        .await
        .unwrap();

        ListenerConfig {
            name: "demo-listener".to_string(),
            route_names: vec!["demo-route".to_string()],
        }
        .store(kvs)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_listener_aborts_build() {
        let kvs = MemoryKVStore::new();
        let err = match build_service_for_listener("ghost", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected build_service_for_listener to fail"),
        };
        assert!(matches!(err, ConfigError::ListenerNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_missing_route_aborts_build() {
        let kvs = MemoryKVStore::new();
        ListenerConfig {
            name: "l".to_string(),
            route_names: vec!["ghost-route".to_string()],
        }
        .store(&kvs)
        .await
        .unwrap();

        let err = match build_service_for_listener("l", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected build_service_for_listener to fail"),
        };
        assert!(matches!(err, ConfigError::RouteNotFound(name) if name == "ghost-route"));
    }

    #[tokio::test]
    async fn test_missing_backend_aborts_build() {
        let kvs = MemoryKVStore::new();
        RouteConfig {
            name: "r".to_string(),
            uri_root: "/".to_string(),
            backend_name: "ghost-backend".to_string(),
            plugin_names: vec![],
            msg_properties: None,
        }
        .store(&kvs)
        .await
        .unwrap();
        ListenerConfig {
            name: "l".to_string(),
            route_names: vec!["r".to_string()],
        }
        .store(&kvs)
        .await
        .unwrap();

        let err = match build_service_for_listener("l", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected build_service_for_listener to fail"),
        };
        assert!(matches!(err, ConfigError::BackendNotFound(name) if name == "ghost-backend"));
    }

    #[tokio::test]
    async fn test_missing_server_aborts_build() {
        let kvs = MemoryKVStore::new();
        BackendConfig {
            name: "b".to_string(),
            server_names: vec!["ghost-server".to_string()],
            load_balancer_policy: String::new(),
            ca_cert_path: None,
        }
        .store(&kvs)
        .await
        .unwrap();
        RouteConfig {
            name: "r".to_string(),
            uri_root: "/".to_string(),
            backend_name: "b".to_string(),
            plugin_names: vec![],
            msg_properties: None,
        }
        .store(&kvs)
        .await
        .unwrap();
        ListenerConfig {
            name: "l".to_string(),
            route_names: vec!["r".to_string()],
        }
        .store(&kvs)
        .await
        .unwrap();

        let err = match build_service_for_listener("l", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected build_service_for_listener to fail"),
        };
        assert!(matches!(err, ConfigError::ServerNotFound(name) if name == "ghost-server"));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_round_robin() {
        let kvs = MemoryKVStore::new();
        seed_store(&kvs).await;

        let service =
            build_service_for_listener("demo-listener", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
                .await
                .unwrap();

        let first = service
            .dispatch(
                Request::builder()
                    .uri("/api/widgets?limit=2")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            first.headers().get("x-upstream-uri").unwrap(),
            "http://localhost:3000/api/widgets?limit=2"
        );

        let second = service
            .dispatch(
                Request::builder()
                    .uri("/api/widgets")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(
            second.headers().get("x-upstream-uri").unwrap(),
            "http://localhost:3001/api/widgets"
        );
    }

    #[tokio::test]
    async fn test_dispatch_unmatched_path_is_404() {
        let kvs = MemoryKVStore::new();
        seed_store(&kvs).await;

        let service =
            build_service_for_listener("demo-listener", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
                .await
                .unwrap();

        let resp = service
            .dispatch(
                Request::builder()
                    .uri("/other")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_all_down_is_503() {
        let kvs = MemoryKVStore::new();
        seed_store(&kvs).await;

        let service =
            build_service_for_listener("demo-listener", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
                .await
                .unwrap();

        let route = &service.routes()[0];
        route.load_balancer.mark_endpoint_down("localhost:3000").unwrap();
        route.load_balancer.mark_endpoint_down("localhost:3001").unwrap();

        let resp = service
            .dispatch(
                Request::builder()
                    .uri("/api/widgets")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("demo-backend"));
    }

    #[tokio::test]
    async fn test_dispatch_transport_failure_is_502() {
        let kvs = MemoryKVStore::new();
        seed_store(&kvs).await;

        let service =
            build_service_for_listener("demo-listener", "0.0.0.0:8080", &kvs, Arc::new(FailingClient))
                .await
                .unwrap();

        let resp = service
            .dispatch(
                Request::builder()
                    .uri("/api/widgets")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_find_route_prefers_longest_prefix() {
        let kvs = MemoryKVStore::new();
        seed_store(&kvs).await;

        RouteConfig {
            name: "nested-route".to_string(),
            uri_root: "/api/admin".to_string(),
            backend_name: "demo-backend".to_string(),
            plugin_names: vec![],
            msg_properties: None,
        }
        .store(&kvs)
        .await
        .unwrap();
        ListenerConfig {
            name: "demo-listener".to_string(),
            route_names: vec!["demo-route".to_string(), "nested-route".to_string()],
        }
        .store(&kvs)
        .await
        .unwrap();

        let service =
            build_service_for_listener("demo-listener", "0.0.0.0:8080", &kvs, Arc::new(EchoingClient))
                .await
                .unwrap();

        assert_eq!(
            service.find_route("/api/admin/users").unwrap().name,
            "nested-route"
        );
        assert_eq!(service.find_route("/api/widgets").unwrap().name, "demo-route");
        assert!(service.find_route("/nope").is_none());
    }
}
