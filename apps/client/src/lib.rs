//! Broker client: holds tunnels open to the broker server, executes allow-listed requests
//! arriving over them, and relays local callers back out

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod manager;
pub mod plugins;
pub mod response;
pub mod scm;
pub mod service;
pub mod shutdown;
pub mod webserver;
pub mod workload;

pub use config::{Args, Config};
pub use context::BrokerContext;
pub use manager::{ConnectionManager, TunnelPairFactory};
