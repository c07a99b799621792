//! Streamed responses delivered out of band
//!
//! The destination side registers a stream with [`StreamStore::begin`] and waits on the
//! returned receiver. The producer side (an HTTP POST or legacy `chunk` messages) writes
//! the head and body through a [`StreamResponseHandler`].

mod framing;
mod handler;
mod store;

pub use framing::{DecodeEvent, FrameDecoder, StreamHead, encode_head};
pub use handler::{StreamResponseHandler, handle_legacy_chunk};
pub use store::{BodyItem, StreamReceiver, StreamStore};
