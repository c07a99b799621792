mod message;
mod request;
mod response;

pub use message::{ErrorCode, Identification, Message, NotificationLevel};
pub use request::{CONTEXT_ID_HEADER, REQUEST_ID_HEADER, RequestPayload};
pub use response::ResponsePayload;
