//! Broker server
//!
//! Accepts client tunnels on `/primus/{token}/`, relays HTTP requests arriving on
//! `/broker/{token}/...` through them, and executes allow-listed requests the clients
//! send back.

pub mod auth;
pub mod config;
pub mod error_handling;
pub mod pool;
pub mod relay;
pub mod routes;
pub mod socket;

pub use config::{Args, Config};
pub use pool::{ClientSocket, ConnectionPool};
pub use routes::router;

use anyhow::{Context, Result};
use broker_common::{
    DownstreamClient, EffectiveConfig, Filters, PoolIndex, RequestPayload, Rule, StreamStore,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Shared state of the server, passed to every handler
#[derive(Debug)]
pub struct AppState {
    pub config: Config,
    pub pool: ConnectionPool,
    pub streams: Arc<StreamStore>,
    /// `None` when no accept file is configured
    pub filters: Option<Filters>,
    /// Server environment used to interpolate rules for client-originated requests
    pub env: EffectiveConfig,
    pub pools: PoolIndex,
    pub downstream: DownstreamClient,
}

impl AppState {
    pub fn new(config: Config, env: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let filters = match &config.accept {
            Some(path) => Some(
                Filters::load(path)
                    .with_context(|| format!("Failed to load accept rules {}", path.display()))?
                    .0,
            ),
            None => None,
        };
        let values: Map<String, Value> = env
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        Ok(Self {
            config,
            pool: ConnectionPool::new(),
            streams: Arc::new(StreamStore::default()),
            filters,
            env: EffectiveConfig::new(values),
            pools: PoolIndex::new(),
            downstream: DownstreamClient::new().context("Failed to build downstream client")?,
        })
    }

    /// Whether a request towards a client passes the public rules
    ///
    /// Without an accept file every request is relayed.
    pub fn outbound_allowed(&self, client: &ClientSocket, payload: &RequestPayload) -> bool {
        match &self.filters {
            None => true,
            Some(filters) => filters
                .for_type(client.metadata.supported_integration_type.as_deref())
                .and_then(|set| set.outbound.matches(payload))
                .is_some(),
        }
    }

    /// Private rule matching a request sent by a client
    ///
    /// Without an accept file nothing matches.
    pub fn inbound_rule(&self, client: &ClientSocket, payload: &RequestPayload) -> Option<Rule> {
        self.filters
            .as_ref()?
            .for_type(client.metadata.supported_integration_type.as_deref())?
            .inbound
            .matches(payload)
    }
}
