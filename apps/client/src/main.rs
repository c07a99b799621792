use anyhow::{Context, Result};
use broker_client::{
    Args, BrokerContext, Config, ConnectionManager, TunnelPairFactory, auth, plugins,
    shutdown::{self, StdProcessExit},
    webserver,
};
use broker_common::mask_token;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
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

    info!("Broker client v{}", env!("CARGO_PKG_VERSION"));
    info!("Broker server: {}", args.server_url);

    let config = Config::from_args(args);
    let broker_config = config
        .load_broker_config(std::env::vars())
        .context("Failed to load broker configuration")?;
    for (name, connection) in &broker_config.connections {
        match &connection.identifier {
            Some(identifier) => info!("Connection {} uses {}", name, mask_token(identifier)),
            None => warn!("Connection {} has no identifier", name),
        }
    }

    let registry =
        plugins::default_registry(&broker_config).context("Failed to load broker plugins")?;
    let listen_address = config.listen_address.clone();
    let ctx = Arc::new(BrokerContext::new(
        config,
        broker_config,
        registry,
        Arc::new(StdProcessExit::default()),
    )?);

    auth::initial_auth(&ctx)
        .await
        .context("Failed to obtain an access token")?;
    let _refresh = auth::spawn_token_refresh(ctx.clone());

    // Open tunnels, then keep them in sync with the configuration
    let manager = Arc::new(ConnectionManager::new(
        ctx.clone(),
        TunnelPairFactory::new(ctx.clone()),
    ));
    manager.sync_once().await;
    let _sync = manager.clone().spawn();

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", listen_address))?;
    info!("Local webserver listening on {}", listen_address);

    // Run until interrupted
    tokio::select! {
        result = axum::serve(listener, webserver::router(ctx.clone())) => {
            error!("Local webserver exited: {:?}", result);
        }
        signal = shutdown::wait_for_signal() => {
            shutdown::shutdown(&ctx, signal).await;
        }
    }

    Ok(())
}
