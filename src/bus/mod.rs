//! Bus module - Publish/subscribe transport used by server and client
//!
//! Provides:
//! - The `MessageBus` trait (publish, subscribe, request/reply)
//! - An in-process bus for tests and local loopback
//! - A NATS-backed bus for deployments

mod memory;
mod nats;

pub use memory::*;
pub use nats::*;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bus errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Failed to subscribe to {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("Failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Failed to request to subject {subject}: {message}")]
    Request { subject: String, message: String },

    #[error("Request to subject {subject} timed out after {timeout_ms} ms")]
    Timeout { subject: String, timeout_ms: u128 },

    #[error("No responders on subject {0}")]
    NoResponders(String),

    #[error("Bus connection closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// One message handed out by a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Raw payload
    pub payload: Bytes,
    /// Implicit reply address, set for requests
    pub reply: Option<String>,
}

/// A live subscription
///
/// Deliveries are buffered in a bounded queue. Dropping the subscription
/// unsubscribes.
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next delivery; `None` once the bus side is gone
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Generic message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a subject
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    /// Subscribe to a subject (wildcards allowed)
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;

    /// Send a request and wait for exactly one reply
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes>;
}

/// Match a subject against a subscription pattern
///
/// `*` matches exactly one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
