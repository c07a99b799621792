mod auth;
mod connection;
mod pending;

pub use auth::AuthState;
pub use connection::{ClientMetadata, Role};
pub use pending::{PendingRequest, PendingRequests};
