mod relay;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{error, info};

use livecast_session::{logging, Config, SignalingHub};

/// Room-scoped WebSocket signaling relay for live broadcasts
#[derive(Debug, Parser)]
#[command(name = "livecast", version, about)]
struct Args {
    /// Path to a TOML/YAML/JSON config file
    #[arg(short, long, env = "LIVECAST_CONFIG_PATH")]
    config: Option<String>,

    /// Listen address, overrides server.host and server.port
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Livecast relay starting...");

    // 3. Serve
    let addr = match args.listen {
        Some(addr) => addr,
        None => config.listen_address().parse()?,
    };
    let state = relay::RelayState::new(SignalingHub::new(), &config.server);
    let router = relay::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind {}: {}", addr, e);
        anyhow::anyhow!("Failed to bind {addr}: {e}")
    })?;
    info!("Signaling relay listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Livecast relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
