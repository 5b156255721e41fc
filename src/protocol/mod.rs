//! Protocol module - Defines the control message contract
//!
//! Messages use a line-oriented text format:
//! - record name (a reserved query or the dotted name of a knob)
//! - tag set (addressing: hostname, method, type, type-id, level)
//! - field set (the `value` field carries request values and reply text)
//! - unix-nanosecond timestamp

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default subject prefix for control requests
pub const DEFAULT_SUBJECT: &str = "cc-control";

/// Default port of the message bus server
pub const DEFAULT_PORT: u16 = 4222;

/// Default client request timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Field carrying the PUT value and the reply payload
pub const VALUE_FIELD: &str = "value";

/// Reserved message names
pub const TOPOLOGY: &str = "topology";
pub const CONTROLS: &str = "controls";

/// Recognised tag keys
pub mod tags {
    pub const HOSTNAME: &str = "hostname";
    pub const METHOD: &str = "method";
    pub const TYPE: &str = "type";
    pub const TYPE_ID: &str = "type-id";
    pub const LEVEL: &str = "level";
}

/// Subject a request for `hostname` is sent on
pub fn request_subject(prefix: &str, hostname: &str) -> String {
    format!("{}.{}", prefix, hostname)
}
