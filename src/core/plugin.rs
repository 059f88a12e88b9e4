//! Opaque middleware plugins wrapped around the request handler.
//!
//! Plugins are registered by name at bootstrap (before any service is
//! built) and resolved when a route's handler chain is assembled. The
//! gateway gives them no semantics beyond wrapping: a plugin receives the
//! next handler and returns a new one.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use futures_util::future::BoxFuture;
use hyper::{Request, Response};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::{core::load_balancer::LoadBalancerError, ports::http_client::HttpClientError};

/// Failure modes of the dispatch path.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// No healthy endpoint was available at selection time; mapped to 503.
    #[error(transparent)]
    Selection(#[from] LoadBalancerError),

    /// Upstream I/O failed; mapped to 502.
    #[error(transparent)]
    Transport(#[from] HttpClientError),
}

/// The request handler type plugins wrap.
pub type RequestHandler = Arc<
    dyn Fn(Request<AxumBody>) -> BoxFuture<'static, Result<Response<AxumBody>, DispatchError>>
        + Send
        + Sync,
>;

/// An opaque middleware wrapper around a request handler.
pub trait Plugin: Send + Sync {
    /// Wrap the next handler, returning the composed handler.
    fn wrap(&self, next: RequestHandler) -> RequestHandler;
}

static PLUGIN_REGISTRY: Lazy<scc::HashMap<String, Arc<dyn Plugin>>> = Lazy::new(scc::HashMap::new);

/// Register a plugin under a name. Registration happens during bootstrap,
/// before any service is assembled; later registrations under the same name
/// replace the earlier one.
pub fn register_plugin(name: &str, plugin: Arc<dyn Plugin>) {
    let _ = PLUGIN_REGISTRY.remove_sync(name);
    let _ = PLUGIN_REGISTRY.insert_sync(name.to_string(), plugin);
    tracing::info!(plugin = %name, "registered plugin");
}

/// Look up a registered plugin by name.
pub fn plugin_for(name: &str) -> Option<Arc<dyn Plugin>> {
    PLUGIN_REGISTRY.read_sync(name, |_, plugin| plugin.clone())
}

/// Wrap `handler` with the named plugins. The first name in `names` becomes
/// the outermost wrapper, so execution order follows the configured order.
pub fn wrap_handler(
    handler: RequestHandler,
    names: &[String],
) -> Result<RequestHandler, crate::config::ConfigError> {
    let mut handler = handler;
    for name in names.iter().rev() {
        let plugin =
            plugin_for(name).ok_or_else(|| crate::config::ConfigError::PluginNotFound(name.clone()))?;
        handler = plugin.wrap(handler);
    }
    Ok(handler)
}
