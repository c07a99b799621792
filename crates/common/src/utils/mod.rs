mod encoding;
mod headers;
mod id;
mod json_path;
mod token;

pub use encoding::{decode_body, encode_body, json_to_form};
pub use headers::Headers;
pub use id::{generate_client_id, generate_request_id, generate_streaming_id};
pub use json_path::{json_lookup, json_lookup_mut};
pub use token::{hash_token, mask_token};
