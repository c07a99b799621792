//! Common types and building blocks for the HTTP broker
//!
//! This crate holds what both sides of the tunnel share: the wire protocol, accept-rule
//! matching, request transformation, streamed responses and downstream HTTP.

pub mod config;
pub mod constants;
pub mod error;
pub mod filter;
pub mod http;
pub mod models;
pub mod plugins;
pub mod protocol;
pub mod stream;
pub mod transform;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use config::{BrokerConfig, ConnectionConfig, EffectiveConfig};
pub use error::{BrokerError, Result};
pub use filter::{CompiledFilterSet, Filter, Filters, Rule, RuleFile, RuleSet};
pub use self::http::DownstreamClient;
pub use models::{AuthState, ClientMetadata, PendingRequests, Role};
pub use plugins::{BrokerPlugin, PluginError, PluginRegistry};
pub use protocol::{ErrorCode, Message, NotificationLevel, RequestPayload, ResponsePayload};
pub use stream::{StreamHead, StreamStore};
pub use transform::{PoolIndex, PreparedRequest};
pub use utils::{Headers, hash_token, mask_token};
