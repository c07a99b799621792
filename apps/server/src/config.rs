use anyhow::{Result, bail};
use broker_common::constants::{
    MINIMAL_RECOMMENDED_BROKER_VERSION, MINIMAL_SUPPORTED_BROKER_VERSION,
    TUNNEL_RESPONSE_TIMEOUT_SECS,
};
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// Clients older than this cannot receive service commands
pub const MINIMAL_SERVICE_ENABLED_BROKER_VERSION: &str = "4.209.0";

/// CLI arguments for the broker server
#[derive(Parser, Debug)]
#[command(name = "broker-server")]
#[command(about = "Broker server accepting client tunnels and relaying HTTP through them", long_about = None)]
#[command(version)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Accept rules file
    #[arg(short, long, env = "ACCEPT")]
    pub accept: Option<PathBuf>,

    /// Require a signed JWT on tunnel upgrades and stream posts
    #[arg(long, env = "BROKER_SERVER_MANDATORY_AUTH_ENABLED")]
    pub mandatory_auth: bool,

    /// HS256 secret used to verify client JWTs
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    #[arg(long, env = "MINIMAL_SUPPORTED_BROKER_VERSION", default_value = MINIMAL_SUPPORTED_BROKER_VERSION)]
    pub minimal_supported_version: String,

    #[arg(long, env = "MINIMAL_RECOMMENDED_BROKER_VERSION", default_value = MINIMAL_RECOMMENDED_BROKER_VERSION)]
    pub minimal_recommended_version: String,

    #[arg(long, env = "MINIMAL_SERVICE_ENABLED_BROKER_VERSION", default_value = MINIMAL_SERVICE_ENABLED_BROKER_VERSION)]
    pub minimal_service_version: String,

    /// Seconds to wait for a relayed response
    #[arg(long, default_value_t = TUNNEL_RESPONSE_TIMEOUT_SECS)]
    pub response_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,

    pub accept: Option<PathBuf>,

    pub mandatory_auth: bool,

    pub jwt_secret: Option<String>,

    /// Identify below this version is refused
    pub minimal_supported_version: String,

    /// Identify below this version gets a warning notification
    pub minimal_recommended_version: String,

    pub minimal_service_version: String,

    /// How long a relayed request waits for the client
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
            accept: None,
            mandatory_auth: false,
            jwt_secret: None,
            minimal_supported_version: MINIMAL_SUPPORTED_BROKER_VERSION.to_string(),
            minimal_recommended_version: MINIMAL_RECOMMENDED_BROKER_VERSION.to_string(),
            minimal_service_version: MINIMAL_SERVICE_ENABLED_BROKER_VERSION.to_string(),
            response_timeout: Duration::from_secs(TUNNEL_RESPONSE_TIMEOUT_SECS),
        }
    }
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            listen_address: format!("{}:{}", args.host, args.port),
            accept: args.accept,
            mandatory_auth: args.mandatory_auth,
            jwt_secret: args.jwt_secret.filter(|s| !s.is_empty()),
            minimal_supported_version: args.minimal_supported_version,
            minimal_recommended_version: args.minimal_recommended_version,
            minimal_service_version: args.minimal_service_version,
            response_timeout: Duration::from_secs(args.response_timeout),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mandatory_auth && self.jwt_secret.is_none() {
            bail!("BROKER_SERVER_MANDATORY_AUTH_ENABLED requires JWT_SECRET");
        }
        Ok(())
    }
}
