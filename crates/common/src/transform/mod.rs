//! Turning a matched rule and a payload into the request sent downstream

mod auth_header;
mod interpolate;
mod prepare;
mod vars;

pub use auth_header::auth_header;
pub use interpolate::{BODY_VAR_SUB_FIELD, HEADER_VAR_SUB, Interpolated, interpolate};
pub use prepare::{
    PrepareError, PrepareOptions, PreparedRequest, apply_hooks, prepare, recompute_content_length,
};
pub use vars::{PoolIndex, replace};
