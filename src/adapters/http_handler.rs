//! Axum adapter exposing a managed service's dispatch entry point.
use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::Request,
    response::Response,
    routing::any,
};
use eyre::{Result, WrapErr};

use crate::{core::service::ManagedService, utils::graceful_shutdown::GracefulShutdown};

/// Bridges incoming axum requests onto [`ManagedService::dispatch`].
pub struct HttpHandler {
    service: Arc<ManagedService>,
}

impl HttpHandler {
    pub fn new(service: Arc<ManagedService>) -> Self {
        Self { service }
    }

    pub async fn handle_request(&self, req: Request) -> Response<Body> {
        self.service.dispatch(req).await
    }

    /// Build the axum router serving every path through dispatch.
    pub fn router(self: &Arc<Self>) -> Router {
        let make_request_route = |handler: Arc<HttpHandler>| {
            any(move |req: Request| {
                let handler = handler.clone();
                async move { Ok::<Response<Body>, Infallible>(handler.handle_request(req).await) }
            })
        };

        Router::new()
            .route("/{*path}", make_request_route(self.clone()))
            .route("/", make_request_route(self.clone()))
    }
}

/// Bind the service's address and serve until shutdown. The accept loop
/// stops on the shutdown signal; in-flight requests drain.
pub async fn serve(service: Arc<ManagedService>, shutdown: &GracefulShutdown) -> Result<()> {
    let handler = Arc::new(HttpHandler::new(service.clone()));
    let app = handler.router();

    let listener = tokio::net::TcpListener::bind(&service.address)
        .await
        .wrap_err_with(|| format!("failed to bind {}", service.address))?;

    tracing::info!(
        listener = %service.listener_name,
        address = %service.address,
        routes = service.routes().len(),
        "gateway listening"
    );

    let mut token = shutdown.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.wait_for_shutdown().await;
            tracing::info!("accept loop stopping, draining in-flight requests");
        })
        .await
        .wrap_err("server error")
}
