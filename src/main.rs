use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::eyre};
use xavi::{
    adapters::{HealthCheckEngine, HttpClientAdapter, http_handler},
    config::models::{
        BackendConfig, ListenerConfig, PingProtocol, RouteConfig, ServerConfig,
    },
    core::service::build_service_for_listener,
    ports::http_client::HttpClient,
    runner,
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[command(name = "xavi", version = runner::build_version(), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Define an upstream server
    AddServer {
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "/health")]
        ping_uri: String,
        /// Probe protocol: http or https
        #[arg(long, default_value = "http")]
        ping_protocol: String,
        #[arg(long, default_value_t = 30_000)]
        health_check_interval_ms: u64,
        #[arg(long, default_value_t = 10_000)]
        health_check_timeout_ms: u64,
    },
    /// Define a backend over a set of servers
    AddBackend {
        #[arg(long)]
        name: String,
        /// Comma-separated server names
        #[arg(long, value_delimiter = ',')]
        servers: Vec<String>,
        #[arg(long, default_value = "round-robin")]
        load_balancer_policy: String,
        #[arg(long)]
        ca_cert_path: Option<String>,
    },
    /// Define a route mapping a URI prefix to a backend
    AddRoute {
        #[arg(long)]
        name: String,
        #[arg(long)]
        uri_root: String,
        #[arg(long)]
        backend: String,
        /// Comma-separated plugin names, applied in order
        #[arg(long, value_delimiter = ',')]
        plugins: Vec<String>,
        #[arg(long)]
        msg_properties: Option<String>,
    },
    /// Define a listener over a set of routes
    AddListener {
        #[arg(long)]
        name: String,
        /// Comma-separated route names
        #[arg(long, value_delimiter = ',')]
        routes: Vec<String>,
    },
    /// List configuration keys under a prefix (servers, backends, routes,
    /// listeners)
    List { prefix: String },
    /// Build the named listener's service and serve it on an address
    Listen {
        listener_name: String,
        address: String,
    },
}

fn parse_ping_protocol(value: &str) -> Result<PingProtocol> {
    match value.to_lowercase().as_str() {
        "http" => Ok(PingProtocol::Http),
        "https" => Ok(PingProtocol::Https),
        other => Err(eyre!("unknown ping protocol '{other}', expected http or https")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let kvs = runner::bootstrap(None).await?;

    match cli.command {
        Commands::AddServer {
            name,
            address,
            port,
            ping_uri,
            ping_protocol,
            health_check_interval_ms,
            health_check_timeout_ms,
        } => {
            let server = ServerConfig {
                name: name.clone(),
                address,
                port,
                ping_uri,
                ping_protocol: parse_ping_protocol(&ping_protocol)?,
                health_check_interval_ms,
                health_check_timeout_ms,
            };
            server.store(&*kvs).await?;
            println!("stored server definition '{name}'");
        }
        Commands::AddBackend {
            name,
            servers,
            load_balancer_policy,
            ca_cert_path,
        } => {
            if servers.is_empty() {
                return Err(eyre!("expected at least one server name"));
            }
            let backend = BackendConfig {
                name: name.clone(),
                server_names: servers,
                load_balancer_policy,
                ca_cert_path,
            };
            backend.store(&*kvs).await?;
            println!("stored backend definition '{name}'");
        }
        Commands::AddRoute {
            name,
            uri_root,
            backend,
            plugins,
            msg_properties,
        } => {
            let route = RouteConfig {
                name: name.clone(),
                uri_root,
                backend_name: backend,
                plugin_names: plugins,
                msg_properties,
            };
            route.store(&*kvs).await?;
            println!("stored route definition '{name}'");
        }
        Commands::AddListener { name, routes } => {
            if routes.is_empty() {
                return Err(eyre!("expected at least one route name"));
            }
            let listener = ListenerConfig {
                name: name.clone(),
                route_names: routes,
            };
            listener.store(&*kvs).await?;
            println!("stored listener definition '{name}'");
        }
        Commands::List { prefix } => {
            let prefix = match prefix.as_str() {
                "servers" | "backends" | "routes" | "listeners" => format!("{prefix}/"),
                other => other.to_string(),
            };
            for key in kvs.list(&prefix).await? {
                println!("{key}");
            }
        }
        Commands::Listen {
            listener_name,
            address,
        } => {
            let shutdown = Arc::new(GracefulShutdown::new());
            let signal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = signal_shutdown.run_signal_handler().await {
                    tracing::error!(error = %e, "signal handler error");
                }
            });

            let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new()?);
            let service = Arc::new(
                build_service_for_listener(&listener_name, &address, &*kvs, http_client.clone())
                    .await?,
            );

            let engine = HealthCheckEngine::new(http_client, &shutdown);
            engine.watch_service(&service);

            http_handler::serve(service, &shutdown).await?;
        }
    }

    Ok(())
}
