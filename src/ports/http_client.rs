use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations.
///
/// `ConnectionError` and `Timeout` are the transport failure modes surfaced
/// to the dispatch path; the service maps them to a 502 for the downstream
/// client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to an upstream fails
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Error when a request times out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Error when the request is invalid
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Error when the upstream returns an error status code
    #[error("upstream returned error status: {status}, url: {url}")]
    UpstreamError {
        /// The URL that was requested
        url: String,
        /// The status code returned by the upstream
        status: StatusCode,
    },
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to
/// upstream servers.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward an HTTP request to an upstream server.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Probe an upstream health endpoint with a GET.
    ///
    /// Returns `Ok(true)` for a 2xx response within `timeout`, `Ok(false)`
    /// for any other response or connection failure. Only a timeout is
    /// reported as an error; probe loops fold it into a `false` verdict.
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<bool>;
}
