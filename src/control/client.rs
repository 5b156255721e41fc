//! Request client
//!
//! Sends one GET or PUT to a node and validates the single reply.

use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use super::dispatcher::ControlList;
use crate::bus::{BusError, MessageBus};
use crate::protocol::{
    request_subject, tags, ControlMessage, Level, MessageError, Tags, CONTROLS, DEFAULT_SUBJECT,
    DEFAULT_TIMEOUT_MS, TOPOLOGY,
};
use crate::topology::Topology;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to create control message for {host}: {source}")]
    Build {
        host: String,
        #[source]
        source: MessageError,
    },

    #[error("Request failed: {0}")]
    Request(#[from] BusError),

    #[error("failed to receive response to subject {0}")]
    NoResponse(String),

    #[error("unexpected name received: {received} (expected: {expected})")]
    NameMismatch { received: String, expected: String },

    #[error("failed to retrieve hostname or mismatched hostname: {received:?} (expected {expected})")]
    HostMismatch {
        received: Option<String>,
        expected: String,
    },

    #[error("reply for {0} is not a log message")]
    NotALog(String),

    #[error("reply for {0} has no level")]
    MissingLevel(String),

    #[error("{0}")]
    Remote(String),

    #[error("Cannot parse reply payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A control addressed on a device, as written on the command line:
/// `<name>@<type>[-<type-id>][=<value>]`
///
/// The type-id is everything after the first `-`, so opaque ids such as
/// PCI addresses pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTarget {
    pub name: String,
    pub device_type: String,
    pub type_id: Option<String>,
    pub value: Option<String>,
}

impl FromStr for ControlTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, value) = match s.split_once('=') {
            Some((address, value)) => (address, Some(value.to_string())),
            None => (s, None),
        };
        let (name, device) = address
            .split_once('@')
            .ok_or_else(|| format!("missing '@<type>' in control '{}'", s))?;
        let (device_type, type_id) = match device.split_once('-') {
            Some((t, id)) => (t, Some(id.to_string())),
            None => (device, None),
        };
        if name.is_empty() || device_type.is_empty() {
            return Err(format!("invalid control '{}'", s));
        }
        if type_id.as_deref() == Some("") || value.as_deref() == Some("") {
            return Err(format!("invalid control '{}'", s));
        }
        Ok(Self {
            name: name.to_string(),
            device_type: device_type.to_string(),
            type_id,
            value,
        })
    }
}

impl fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.device_type)?;
        if let Some(id) = &self.type_id {
            write!(f, "-{}", id)?;
        }
        if let Some(value) = &self.value {
            write!(f, "={}", value)?;
        }
        Ok(())
    }
}

/// Client for the control protocol
///
/// Holds no per-request state; calls may run concurrently over a shared bus.
#[derive(Clone)]
pub struct ControlClient {
    bus: Arc<dyn MessageBus>,
    subject: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            subject: DEFAULT_SUBJECT.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Catalog of controls offered by `host`
    pub async fn get_controls(&self, host: &str) -> ClientResult<ControlList> {
        let request = self.build_get(host, CONTROLS, "node", Some("0"))?;
        let text = self.exchange(host, &request).await?;
        parse_json(&text)
    }

    /// Topology snapshot of `host`
    pub async fn get_topology(&self, host: &str) -> ClientResult<Topology> {
        let request = self.build_get(host, TOPOLOGY, "node", Some("0"))?;
        let text = self.exchange(host, &request).await?;
        parse_json(&text)
    }

    /// Read a knob on one device of `host`
    pub async fn get_control_value(
        &self,
        host: &str,
        name: &str,
        device_type: &str,
        type_id: Option<&str>,
    ) -> ClientResult<String> {
        let request = self.build_get(host, name, device_type, type_id)?;
        self.exchange(host, &request).await
    }

    /// Write a knob on one device of `host`
    pub async fn set_control_value(
        &self,
        host: &str,
        name: &str,
        device_type: &str,
        type_id: Option<&str>,
        value: &str,
    ) -> ClientResult<()> {
        let request = ControlMessage::new_put_control(
            name,
            addressing(host, device_type, type_id),
            Tags::new(),
            value,
            SystemTime::now(),
        )
        .map_err(|source| ClientError::Build {
            host: host.to_string(),
            source,
        })?;
        self.exchange(host, &request).await.map(|_| ())
    }

    fn build_get(
        &self,
        host: &str,
        name: &str,
        device_type: &str,
        type_id: Option<&str>,
    ) -> ClientResult<ControlMessage> {
        ControlMessage::new_get_control(
            name,
            addressing(host, device_type, type_id),
            Tags::new(),
            SystemTime::now(),
        )
        .map_err(|source| ClientError::Build {
            host: host.to_string(),
            source,
        })
    }

    /// Send the request and return the text of an INFO reply
    async fn exchange(&self, host: &str, request: &ControlMessage) -> ClientResult<String> {
        let subject = request_subject(&self.subject, host);
        tracing::debug!("Requesting on {}: {}", subject, request);
        let payload = self.bus.request(&subject, request.encode(), self.timeout).await?;

        let reply = ControlMessage::decode(&payload)
            .ok()
            .and_then(|replies| replies.into_iter().next())
            .ok_or_else(|| ClientError::NoResponse(subject.clone()))?;
        unwrap_reply(host, request.name(), &reply)
    }
}

fn addressing(host: &str, device_type: &str, type_id: Option<&str>) -> Tags {
    let mut tags = Tags::from([
        (tags::HOSTNAME.to_string(), host.to_string()),
        (tags::TYPE.to_string(), device_type.to_string()),
    ]);
    if let Some(id) = type_id {
        tags.insert(tags::TYPE_ID.to_string(), id.to_string());
    }
    tags
}

/// Validate a reply against the request it answers
pub fn unwrap_reply(host: &str, name: &str, reply: &ControlMessage) -> ClientResult<String> {
    if reply.name() != name {
        return Err(ClientError::NameMismatch {
            received: reply.name().to_string(),
            expected: name.to_string(),
        });
    }
    match reply.tag(tags::HOSTNAME) {
        Some(h) if h == host => {}
        other => {
            return Err(ClientError::HostMismatch {
                received: other.map(str::to_string),
                expected: host.to_string(),
            })
        }
    }
    let text = reply
        .log_value()
        .ok_or_else(|| ClientError::NotALog(name.to_string()))?;
    let level = reply
        .tag(tags::LEVEL)
        .ok_or_else(|| ClientError::MissingLevel(name.to_string()))?;

    match level.parse::<Level>() {
        Ok(Level::Info) => Ok(text),
        Ok(Level::Error) => {
            tracing::error!("Host {}: {}", host, text);
            Err(ClientError::Remote(text))
        }
        Err(_) => Err(ClientError::MissingLevel(name.to_string())),
    }
}

fn parse_json<T: DeserializeOwned>(text: &str) -> ClientResult<T> {
    Ok(serde_json::from_str(text)?)
}
