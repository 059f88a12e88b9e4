pub mod models;

pub use models::{
    BackendConfig, ConfigError, ListenerConfig, PingProtocol, RouteConfig, ServerConfig,
    read_backend_config, read_listener_config, read_route_config, read_server_config,
};
