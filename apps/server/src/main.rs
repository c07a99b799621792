use anyhow::{Context, Result};
use broker_server::{AppState, Args, Config, router};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(false)
            .init();
    }

    info!("Broker server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(args);
    config.validate()?;
    if config.accept.is_none() {
        info!("No accept file configured, client requests will be blocked");
    }
    let listen_address = config.listen_address.clone();
    let state = Arc::new(AppState::new(config, std::env::vars())?);
    let _sweeper = state.streams.clone().spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", listen_address))?;
    info!("Broker server listening on {}", listen_address);

    // Run until interrupted
    tokio::select! {
        result = axum::serve(listener, router(state)) => {
            error!("Server exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
    }

    Ok(())
}
