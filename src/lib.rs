//! Xavi - a configurable HTTP reverse proxy and service gateway.
//!
//! Operators define *listeners* (bound addresses), which reference *routes*
//! (URI-prefix match plus an optional plugin chain), which reference
//! *backends* (named pools of upstream servers with a load-balancing policy
//! and a health-check protocol). Definitions live in a pluggable key/value
//! store and are consulted at service-build time to assemble a runnable
//! listener.
//!
//! # Features
//! - Round-robin (and random) load balancing over per-backend endpoint pools
//! - Per-endpoint health probes with pluggable custom checks and automatic
//!   up/down feedback into the pool
//! - Listener → routes → backend service assembly from a KV store
//! - Longest-prefix request routing with opaque middleware plugins
//! - End-to-end timing trees (per-request, per-stage, per-upstream-call)
//!   with deterministic JSON rendering
//! - Structured JSON logging via `tracing` and gauge metrics per endpoint
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use xavi::{
//!     adapters::{HttpClientAdapter, MemoryKVStore},
//!     core::service::build_service_for_listener,
//!     ports::http_client::HttpClient,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let kvs = MemoryKVStore::open("file:///var/xavi/config.json").await?;
//! let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new()?);
//! let _service = build_service_for_listener("listener1", "0.0.0.0:8080", &kvs, client).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping the load balancer, health-check engine,
//! service assembly, and timer tree inside `core`. Prefer the documented
//! re-exports over reaching into internal modules.
//!
//! # Error Handling
//! Fallible APIs return domain error types (`ConfigError`,
//! `LoadBalancerError`, `HealthCheckError`, `HttpClientError`);
//! `eyre::Result` appears only at the application boundary.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod runner;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the types most embedders need.
pub use crate::{
    adapters::{HealthCheckEngine, HttpClientAdapter, HttpHandler, MemoryKVStore},
    core::{
        EndToEndTimer, LoadBalancer, ManagedService, build_load_balancer,
        build_service_for_listener,
        health_check::{health_check_for_server, register_health_check_for_server},
        plugin::{Plugin, register_plugin},
    },
    ports::{HttpClient, KVStore},
    utils::GracefulShutdown,
};
