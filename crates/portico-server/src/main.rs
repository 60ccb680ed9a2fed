use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portico_config::{ConfigManager, EndpointConfig};
use portico_gateway::{
    serve, AuthConfig, BuiltinHandler, DispatchRouter, EndpointManager, EndpointSettings,
    ServerOptions,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

use logging::init_logging;

#[derive(Parser, Debug, Clone)]
#[command(name = "portico-server")]
#[command(about = "Endpoint-scoped WebSocket server")]
#[command(version)]
struct Cli {
    /// Config file path [default: ~/.portico/config.json]
    #[arg(long, env = "PORTICO_CONFIG")]
    config: Option<String>,

    /// Bind address (overrides config)
    #[arg(long, env = "PORTICO_BIND")]
    bind: Option<String>,

    /// Log filter (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = config_path(cli.config.as_deref())?;
    let config_manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let mut config = config_manager.snapshot();

    // CLI overrides config
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if cli.json_logs {
        config.logging.json_format = true;
    }

    init_logging(&config.logging, cli.log_level.as_deref())?;
    info!("Config loaded from {:?}", config_manager.path());

    let managers: Vec<EndpointManager> = config.endpoints.iter().map(spawn_endpoint).collect();
    let router = Arc::new(DispatchRouter::new(managers).context("Invalid endpoint table")?);

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    serve(
        listener,
        router,
        ServerOptions::from(&config.server),
        shutdown,
    )
    .await?;

    info!("Portico server exited");
    Ok(())
}

fn config_path(flag: Option<&str>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(portico_config::expand_tilde(path).unwrap_or_else(|| PathBuf::from(path))),
        None => portico_config::default_config_path()
            .context("Could not determine home directory; pass --config"),
    }
}

/// Resolve an endpoint's auth policy from the process environment and start
/// its manager.
fn spawn_endpoint(endpoint: &EndpointConfig) -> EndpointManager {
    let auth = AuthConfig::resolve(&endpoint.auth_options, |name| std::env::var(name).ok());
    if auth.bypass {
        warn!(endpoint = %endpoint.endpoint, "authentication bypass is active");
    }
    info!(
        endpoint = %endpoint.endpoint,
        handler = endpoint.handler.as_str(),
        users = auth.known_users.len(),
        "endpoint configured"
    );

    let mut settings = EndpointSettings::new(endpoint.endpoint.clone(), auth);
    if let Some(max) = endpoint.max_connections {
        settings = settings.max_connections(max);
    }
    EndpointManager::spawn(
        settings,
        Arc::new(BuiltinHandler::new(endpoint.handler, endpoint.welcome)),
    )
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
