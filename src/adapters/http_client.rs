use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr, eyre};
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Forwards requests to upstream endpoints, forcing HTTP/1.1 framing while
///   ALPN may negotiate h2
/// * Performs GET health probes with a per-probe timeout
/// * Trust roots default to the platform store; a backend's `ca_cert_path`
///   PEM can be layered on via [`HttpClientAdapter::with_ca_cert`]
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create an adapter trusting the platform root store.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Create an adapter that additionally trusts the certificates in the
    /// given PEM file.
    pub fn with_ca_cert(ca_cert_path: &str) -> Result<Self> {
        Self::build(Some(ca_cert_path))
    }

    fn build(ca_cert_path: Option<&str>) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add native certificate to trust store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        if let Some(path) = ca_cert_path {
            let pem = std::fs::read(path)
                .wrap_err_with(|| format!("failed to read CA cert file {path}"))?;
            let mut reader = &*pem;
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.wrap_err_with(|| format!("failed to parse CA cert in {path}"))?;
                root_cert_store
                    .add(cert)
                    .map_err(|e| eyre!("failed to add CA cert from {path}: {e}"))?;
                added += 1;
            }
            if added == 0 {
                return Err(eyre!("no certificates found in {path}"));
            }
            tracing::info!(path = %path, certs = added, "added backend trust roots");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let client = self.client.clone();

        // Set the Host header from the rewritten URI.
        if let Some(host_str) = req.uri().host() {
            let host_header_val = if let Some(port) = req.uri().port() {
                HeaderValue::from_str(&format!("{host_str}:{}", port.as_u16()))
                    .unwrap_or_else(|_| HeaderValue::from_static(""))
            } else {
                HeaderValue::from_str(host_str).unwrap_or_else(|_| HeaderValue::from_static(""))
            };
            if !host_header_val.is_empty() {
                req.headers_mut().insert(header::HOST, host_header_val);
            }
        } else {
            return Err(HttpClientError::InvalidRequest(
                "outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        let method_for_error = parts.method.clone();
        let uri_for_error = parts.uri.clone();
        tracing::debug!(method = %parts.method, uri = %parts.uri, "forwarding request upstream");

        match client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed downstream; drop the upstream framing
                // header.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::error!(
                    method = %method_for_error,
                    uri = %uri_for_error,
                    error = %e,
                    "upstream request failed"
                );
                Err(HttpClientError::ConnectionError(format!(
                    "request to {method_for_error} {uri_for_error} failed: {e}"
                )))
            }
        }
    }

    async fn health_check(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<bool> {
        let client = self.client.clone();

        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(probe_timeout, client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // Consume the body so the connection can be reused.
                let _ = response.into_body().collect().await;
                tracing::debug!(url = %url, healthy = is_healthy, "health probe completed");
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!(url = %url, error = %err, "health probe connection failed");
                Ok(false)
            }
            Err(_) => {
                tracing::debug!(url = %url, "health probe timed out");
                Err(HttpClientError::Timeout(probe_timeout))
            }
        }
    }
}
