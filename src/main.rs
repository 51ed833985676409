use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod config;
mod error;
mod health;
mod proxy;
mod registry;

use admin::AppState;
use config::Config;
use health::HealthChecker;
use proxy::Gateway;
use registry::ServiceRegistry;

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "A resilient API gateway with load balancing, circuit breaking and bulkheads")]
struct Args {
    /// Optional YAML route table; the built-in routes are used otherwise.
    #[arg(short, long)]
    config: Option<String>,

    /// Overall request timeout (client -> gateway -> backend -> client).
    #[arg(long, default_value = "30s", value_parser = config::parse_duration)]
    request_timeout: Duration,

    /// Per-attempt backend timeout.
    #[arg(long, default_value = "5s", value_parser = config::parse_duration)]
    backend_timeout: Duration,

    /// TCP connection timeout.
    #[arg(long, default_value = "2s", value_parser = config::parse_duration)]
    connect_timeout: Duration,

    /// Use localhost instead of host.docker.internal for built-in backends.
    #[arg(long)]
    use_localhost: bool,

    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting API gateway");

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::builtin(args.use_localhost),
    };
    config.server.port = args.port;
    config.timeouts.request_timeout = args.request_timeout;
    config.timeouts.backend_timeout = args.backend_timeout;
    config.timeouts.connect_timeout = args.connect_timeout;
    config.validate()?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let gateway = Arc::new(Gateway::new(&config)?);
    let registry = Arc::new(ServiceRegistry::new());

    let health_checker = Arc::new(HealthChecker::new(
        registry.clone(),
        gateway.route_table(),
        config.health_check.clone(),
    ));
    let health_task = tokio::spawn(health_checker.run());

    let app = admin::router(AppState {
        gateway,
        registry,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_task.abort();
    info!("Gateway shutdown complete");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
