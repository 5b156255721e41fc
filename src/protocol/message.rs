//! Control message definitions
//!
//! A typed view over a codec [`Record`] that tells GET/PUT requests apart
//! from log-style replies.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

use super::codec::{self, CodecError, CodecResult, FieldValue, Record};
use super::{tags, VALUE_FIELD};

/// Tag and meta maps
pub type Tags = BTreeMap<String, String>;

/// Message construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Invalid control message: {0}")]
    Invalid(#[from] CodecError),

    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Unknown level '{0}'")]
    UnknownLevel(String),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Request method carried in the `method` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
        }
    }
}

impl FromStr for Method {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            other => Err(MessageError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply classification carried in the `level` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Info,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

impl FromStr for Level {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Level::Info),
            "ERROR" => Ok(Level::Error),
            other => Err(MessageError::UnknownLevel(other.to_string())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of exchange between requester and node agent
///
/// `meta` travels with the message inside a process but is never put on
/// the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    record: Record,
    meta: Tags,
}

impl ControlMessage {
    /// Build a GET request; the value field is a placeholder
    pub fn new_get_control(
        name: impl Into<String>,
        mut tags: Tags,
        meta: Tags,
        time: SystemTime,
    ) -> MessageResult<Self> {
        tags.insert(tags::METHOD.to_string(), Method::Get.as_str().to_string());
        let fields = BTreeMap::from([(VALUE_FIELD.to_string(), FieldValue::Float(0.0))]);
        Ok(Self {
            record: Record::new(name, tags, fields, time)?,
            meta,
        })
    }

    /// Build a PUT request carrying the value to write
    pub fn new_put_control(
        name: impl Into<String>,
        mut tags: Tags,
        meta: Tags,
        value: impl Into<FieldValue>,
        time: SystemTime,
    ) -> MessageResult<Self> {
        tags.insert(tags::METHOD.to_string(), Method::Put.as_str().to_string());
        let fields = BTreeMap::from([(VALUE_FIELD.to_string(), value.into())]);
        Ok(Self {
            record: Record::new(name, tags, fields, time)?,
            meta,
        })
    }

    /// Build a log-style message (a reply); any `method` tag is dropped
    pub fn new_log(
        name: impl Into<String>,
        mut tags: Tags,
        meta: Tags,
        text: impl Into<String>,
        time: SystemTime,
    ) -> MessageResult<Self> {
        tags.remove(tags::METHOD);
        let fields = BTreeMap::from([(VALUE_FIELD.to_string(), FieldValue::String(text.into()))]);
        Ok(Self {
            record: Record::new(name, tags, fields, time)?,
            meta,
        })
    }

    pub fn from_record(record: Record) -> Self {
        Self {
            record,
            meta: Tags::new(),
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn tags(&self) -> &Tags {
        self.record.tags()
    }

    pub fn meta(&self) -> &Tags {
        &self.meta
    }

    pub fn time(&self) -> SystemTime {
        self.record.time()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.record.tag(key)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.record.field(key)
    }

    /// Insert or overwrite a tag, e.g. to stamp a reply before sending
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> MessageResult<()> {
        self.record.set_tag(key, value)?;
        Ok(())
    }

    /// True if the `method` tag is GET or PUT
    pub fn is_control(&self) -> bool {
        self.control_method().is_some()
    }

    pub fn control_method(&self) -> Option<Method> {
        self.tag(tags::METHOD).and_then(|m| m.parse().ok())
    }

    /// The value to write, only for PUT requests
    pub fn control_value(&self) -> Option<&FieldValue> {
        match self.control_method() {
            Some(Method::Put) => self.field(VALUE_FIELD),
            _ => None,
        }
    }

    /// True for replies: a value field and no method tag
    pub fn is_log(&self) -> bool {
        self.tag(tags::METHOD).is_none() && self.field(VALUE_FIELD).is_some()
    }

    /// The reply text, only for log messages
    pub fn log_value(&self) -> Option<String> {
        if self.is_log() {
            self.field(VALUE_FIELD).map(ToString::to_string)
        } else {
            None
        }
    }

    /// Wire encoding of this message
    pub fn encode(&self) -> Bytes {
        codec::encode(&self.record)
    }

    /// Decode every message in a payload
    pub fn decode(buf: &[u8]) -> CodecResult<Vec<ControlMessage>> {
        Ok(codec::decode(buf)?
            .into_iter()
            .map(ControlMessage::from_record)
            .collect())
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

/// Build the reply to `request` with the given level and text
///
/// Every handler branch goes through here. The request's tags and meta are
/// carried over; the `hostname` tag is stamped later by the dispatcher.
pub fn build_reply(
    request: &ControlMessage,
    level: Level,
    text: impl Into<String>,
) -> MessageResult<ControlMessage> {
    let mut reply = ControlMessage::new_log(
        request.name(),
        request.tags().clone(),
        request.meta().clone(),
        text,
        SystemTime::now(),
    )?;
    reply.add_tag(tags::LEVEL, level.as_str())?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_tags() -> Tags {
        Tags::from([
            (tags::HOSTNAME.to_string(), "nodeA".to_string()),
            (tags::TYPE.to_string(), "socket".to_string()),
            (tags::TYPE_ID.to_string(), "0".to_string()),
        ])
    }

    #[test]
    fn test_get_control() {
        let msg = ControlMessage::new_get_control(
            "rapl.pkg_limit_1",
            request_tags(),
            Tags::new(),
            SystemTime::now(),
        )
        .unwrap();
        assert!(msg.is_control());
        assert!(!msg.is_log());
        assert_eq!(msg.control_method(), Some(Method::Get));
        assert_eq!(msg.control_value(), None);
        assert_eq!(msg.tag(tags::HOSTNAME), Some("nodeA"));
    }

    #[test]
    fn test_put_control() {
        let msg = ControlMessage::new_put_control(
            "rapl.pkg_limit_1",
            request_tags(),
            Tags::new(),
            "200000000",
            SystemTime::now(),
        )
        .unwrap();
        assert_eq!(msg.control_method(), Some(Method::Put));
        assert_eq!(msg.control_value(), Some(&FieldValue::from("200000000")));
    }

    #[test]
    fn test_log_drops_method() {
        let mut tags = request_tags();
        tags.insert(tags::METHOD.to_string(), "GET".to_string());
        let msg = ControlMessage::new_log("topology", tags, Tags::new(), "{}", SystemTime::now())
            .unwrap();
        assert!(msg.is_log());
        assert!(!msg.is_control());
        assert_eq!(msg.log_value().as_deref(), Some("{}"));
    }

    #[test]
    fn test_construction_rejects_empty_name() {
        let err = ControlMessage::new_get_control("", request_tags(), Tags::new(), SystemTime::now())
            .unwrap_err();
        assert_eq!(err, MessageError::Invalid(CodecError::EmptyName));
    }

    #[test]
    fn test_invalid_method_is_not_control() {
        let msg = ControlMessage::decode(b"knob,method=POST,type=node value=1").unwrap();
        assert!(!msg[0].is_control());
        assert!(!msg[0].is_log());
    }

    #[test]
    fn test_build_reply() {
        let request = ControlMessage::new_get_control(
            "cpu_freq.cur_cpu_freq",
            request_tags(),
            Tags::from([("unit".to_string(), "Hz".to_string())]),
            SystemTime::now(),
        )
        .unwrap();
        let reply = build_reply(&request, Level::Error, "boom").unwrap();
        assert_eq!(reply.name(), request.name());
        assert_eq!(reply.tag(tags::LEVEL), Some("ERROR"));
        assert_eq!(reply.tag(tags::TYPE), Some("socket"));
        assert_eq!(reply.meta().get("unit").map(String::as_str), Some("Hz"));
        assert_eq!(reply.log_value().as_deref(), Some("boom"));
    }

    #[test]
    fn test_wire_roundtrip_keeps_name_tags_value() {
        let msg = ControlMessage::new_put_control(
            "rapl.pkg_limit_1",
            request_tags(),
            Tags::new(),
            200000000i64,
            SystemTime::now(),
        )
        .unwrap();
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name(), msg.name());
        assert_eq!(decoded[0].tags(), msg.tags());
        assert_eq!(decoded[0].control_value(), Some(&FieldValue::Integer(200000000)));
    }

    #[test]
    fn test_method_and_level_parse() {
        assert_eq!("PUT".parse::<Method>(), Ok(Method::Put));
        assert!("put".parse::<Method>().is_err());
        assert_eq!("INFO".parse::<Level>(), Ok(Level::Info));
        assert_eq!(Level::Error.to_string(), "ERROR");
    }
}
