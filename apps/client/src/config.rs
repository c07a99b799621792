use broker_common::{
    BrokerConfig, ConnectionConfig,
    constants::{
        CONNECT_TIMEOUT_MS, PING_INTERVAL_MS, PONG_TIMEOUT_MS, RECONNECT_FACTOR,
        RECONNECT_MAX_DELAY_MS, RECONNECT_MAX_RETRIES, RECONNECT_MIN_DELAY_MS,
    },
};
use clap::Parser;
use serde_json::{Map, Value};
use std::{path::PathBuf, time::Duration};

/// Connection name used when a single `BROKER_TOKEN` is configured
pub const CLASSIC_CONNECTION: &str = "default";

/// CLI arguments for the broker client
#[derive(Parser, Debug)]
#[command(name = "broker-client")]
#[command(about = "Broker client relaying allow-listed HTTP traffic over a tunnel", long_about = None)]
#[command(version)]
pub struct Args {
    /// Broker server base URL
    #[arg(long, env = "BROKER_SERVER_URL")]
    pub server_url: String,

    /// Broker token for a single classic connection
    #[arg(short, long, env = "BROKER_TOKEN")]
    pub token: Option<String>,

    /// Connections file; takes precedence over --token
    #[arg(short, long, env = "BROKER_CLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Accept rules file
    #[arg(short, long, env = "ACCEPT")]
    pub accept: Option<PathBuf>,

    /// Local webserver port
    #[arg(short, long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Local webserver address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// API used for OAuth and connection renewal
    #[arg(long, env = "API_BASE_URL", default_value = "https://api.snyk.io")]
    pub api_base_url: String,

    /// OAuth client id
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Renewal interval in milliseconds, overriding the token lifetime
    #[arg(long, env = "AUTH_EXPIRATION_OVERRIDE")]
    pub auth_expiration_override: Option<u64>,

    /// Ask the dispatcher which server to pin to
    #[arg(long, env = "BROKER_HA_MODE_ENABLED")]
    pub ha_mode: bool,

    /// Dispatcher base URL
    #[arg(
        long,
        env = "BROKER_DISPATCHER_BASE_URL",
        default_value = "https://api.snyk.io"
    )]
    pub dispatcher_url: String,

    /// Deployment location reported to the dispatcher
    #[arg(long, env = "DEPLOYMENT_LOCATION", default_value = "snyk-broker-client")]
    pub deployment_location: String,

    /// Send https downstream requests over plain http
    #[arg(long, env = "INSECURE_DOWNSTREAM")]
    pub insecure_downstream: bool,

    /// Strip every x-forwarded-* header from relayed requests
    #[arg(long, env = "REMOVE_X_FORWARDED_HEADERS")]
    pub remove_x_forwarded_headers: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Connection timeout in milliseconds
    #[arg(long, default_value_t = CONNECT_TIMEOUT_MS)]
    pub connect_timeout: u64,
}

/// Configuration for the client
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker server base URL (e.g., "https://broker.snyk.io")
    pub server_url: String,

    /// Single token, when no connections file is given
    pub classic_token: Option<String>,

    pub connections_file: Option<PathBuf>,

    pub accept: Option<PathBuf>,

    /// Local webserver bind address
    pub listen_address: String,

    pub api_base_url: String,

    pub oauth: Option<OAuthCredentials>,

    pub auth_expiration_override: Option<u64>,

    /// Present when HA mode is enabled
    pub dispatcher: Option<DispatcherConfig>,

    pub insecure_downstream: bool,

    pub remove_x_forwarded_headers: bool,

    /// Connection and handshake timeout
    pub connect_timeout: Duration,

    /// Application-level ping interval
    pub heartbeat_interval: Duration,

    /// Time allowed for a pong after the ping interval
    pub pong_timeout: Duration,

    /// Reconnection strategy
    pub reconnect_config: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub deployment_location: String,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            multiplier: RECONNECT_FACTOR,
            max_attempts: Some(RECONNECT_MAX_RETRIES),
        }
    }
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let oauth = match (args.client_id, args.client_secret) {
            (Some(client_id), Some(client_secret)) => Some(OAuthCredentials {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let dispatcher = args.ha_mode.then(|| DispatcherConfig {
            base_url: args.dispatcher_url.trim_end_matches('/').to_string(),
            deployment_location: args.deployment_location,
        });

        Self {
            server_url: args.server_url.trim_end_matches('/').to_string(),
            classic_token: args.token,
            connections_file: args.config,
            accept: args.accept,
            listen_address: format!("{}:{}", args.host, args.port),
            api_base_url: args.api_base_url.trim_end_matches('/').to_string(),
            oauth,
            auth_expiration_override: args.auth_expiration_override,
            dispatcher,
            insecure_downstream: args.insecure_downstream,
            remove_x_forwarded_headers: args.remove_x_forwarded_headers,
            connect_timeout: Duration::from_millis(args.connect_timeout),
            heartbeat_interval: Duration::from_millis(PING_INTERVAL_MS),
            pong_timeout: Duration::from_millis(PONG_TIMEOUT_MS),
            reconnect_config: ReconnectConfig::default(),
        }
    }

    /// Whether connections come from a connections file rather than a single token
    pub fn is_universal(&self) -> bool {
        self.connections_file.is_some()
    }

    /// Load the broker configuration, with `env` as the lowest-precedence globals
    pub fn load_broker_config(
        &self,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> broker_common::Result<BrokerConfig> {
        let mut config = match &self.connections_file {
            Some(path) => BrokerConfig::load(path)?,
            None => classic_broker_config(self.classic_token.as_deref()),
        };

        let mut global: Map<String, Value> = env
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        global.extend(std::mem::take(&mut config.global));
        config.global = global;
        Ok(config)
    }
}

/// A configuration with one connection carrying the classic broker token
pub fn classic_broker_config(token: Option<&str>) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.connections.insert(
        CLASSIC_CONNECTION.to_string(),
        ConnectionConfig::new(CLASSIC_CONNECTION, token),
    );
    config
}
