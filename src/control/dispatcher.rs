//! Request dispatch
//!
//! Turns one inbound control message into at most one reply. Nothing here
//! touches the bus; the server loop feeds messages in and publishes what
//! comes out.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::backend::{CapabilityBackend, DeviceGuard, DeviceType, SysFeature};
use crate::protocol::{build_reply, tags, ControlMessage, Level, MessageError, Method, CONTROLS, TOPOLOGY};
use crate::topology::TopologyProvider;

/// Dispatch errors
///
/// Bad requests are answered with an ERROR reply; only a reply that cannot
/// be built at all ends up here.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Cannot build reply: {0}")]
    Reply(#[from] MessageError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Where a message is routed, decided once from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Topology,
    Catalog,
    Knob(&'a str),
}

impl<'a> Route<'a> {
    pub fn of(name: &'a str) -> Self {
        match name {
            TOPOLOGY => Route::Topology,
            CONTROLS => Route::Catalog,
            knob => Route::Knob(knob),
        }
    }
}

/// One entry of the `controls` catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlListEntry {
    pub category: String,
    pub name: String,
    pub device_type: String,
    pub description: String,
    pub methods: String,
}

impl From<&SysFeature> for ControlListEntry {
    fn from(feature: &SysFeature) -> Self {
        Self {
            category: feature.category.clone(),
            name: feature.name.clone(),
            device_type: feature.device_type.to_string(),
            description: feature.description.clone(),
            methods: feature.methods().to_string(),
        }
    }
}

/// Payload of a `controls` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlList {
    pub controls: Vec<ControlListEntry>,
}

/// Server-side request router
pub struct Dispatcher {
    hostname: String,
    backend: Arc<dyn CapabilityBackend>,
    topology: Arc<dyn TopologyProvider>,
}

impl Dispatcher {
    pub fn new(
        hostname: impl Into<String>,
        backend: Arc<dyn CapabilityBackend>,
        topology: Arc<dyn TopologyProvider>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            backend,
            topology,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Handle one message
    ///
    /// Returns `None` for messages addressed to another node.
    pub fn handle(&self, request: &ControlMessage) -> DispatchResult<Option<ControlMessage>> {
        if let Some(target) = request.tag(tags::HOSTNAME) {
            if target != self.hostname {
                tracing::debug!("Dropping non-local command for {}", target);
                return Ok(None);
            }
        }

        let route = Route::of(request.name());
        tracing::debug!("Routing {} to {:?}", request.name(), route);
        let (level, text) = match route {
            Route::Topology => self.topology_reply(),
            Route::Catalog => self.catalog_reply(),
            Route::Knob(name) => self.knob_reply(name, request),
        };

        let mut reply = build_reply(request, level, text)?;
        reply.add_tag(tags::HOSTNAME, self.hostname.as_str())?;
        tracing::debug!("Reply for {} with level {}", request.name(), level);
        Ok(Some(reply))
    }

    fn topology_reply(&self) -> (Level, String) {
        let json = self
            .topology
            .snapshot()
            .map_err(|e| e.to_string())
            .and_then(|t| serde_json::to_string(&t).map_err(|e| e.to_string()));
        match json {
            Ok(json) => (Level::Info, json),
            Err(e) => {
                tracing::error!("Cannot produce topology: {}", e);
                (Level::Error, e)
            }
        }
    }

    fn catalog_reply(&self) -> (Level, String) {
        let json = self
            .backend
            .list()
            .map_err(|e| e.to_string())
            .and_then(|features| {
                let list = ControlList {
                    controls: features.iter().map(ControlListEntry::from).collect(),
                };
                serde_json::to_string(&list).map_err(|e| e.to_string())
            });
        match json {
            Ok(json) => (Level::Info, json),
            Err(e) => {
                tracing::error!("Cannot produce control list: {}", e);
                (Level::Error, e)
            }
        }
    }

    fn knob_reply(&self, name: &str, request: &ControlMessage) -> (Level, String) {
        let Some(device_type) = request.tag(tags::TYPE) else {
            return (Level::Error, format!("No 'type' tag in {}", request));
        };
        let type_id = match request.tag(tags::TYPE_ID) {
            Some(id) => id,
            None if device_type == DeviceType::Node.as_str() => "0",
            None => return (Level::Error, format!("No 'type-id' tag in {}", request)),
        };
        let method = match request.tag(tags::METHOD) {
            None => return (Level::Error, format!("No 'method' tag in {}", request)),
            Some(m) => match m.parse::<Method>() {
                Ok(method) => method,
                Err(_) => return (Level::Error, format!("Invalid 'method' tag in {}", request)),
            },
        };
        let value = match method {
            Method::Put => match request.control_value() {
                Some(value) => Some(value.to_string()),
                None => return (Level::Error, format!("No 'value' field in {}", request)),
            },
            Method::Get => None,
        };

        let device_label = format!("{}/{}", device_type, type_id);
        let device = match device_type
            .parse::<DeviceType>()
            .and_then(|t| DeviceGuard::open(self.backend.as_ref(), t, type_id))
        {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("Cannot create device {}: {}", device_label, e);
                return (Level::Error, format!("Cannot create device `{}`", device_label));
            }
        };

        match value {
            Some(value) => {
                tracing::debug!("Set {} for device {} to {}", name, device_label, value);
                match device.set(name, &value) {
                    Ok(()) => (
                        Level::Info,
                        format!("Set `{}={}` for device `{}`", name, value, device_label),
                    ),
                    Err(e) => {
                        tracing::warn!("Set {} on {} failed: {}", name, device_label, e);
                        (
                            Level::Error,
                            format!("Failed to set `{}={}` for device `{}`", name, value, device_label),
                        )
                    }
                }
            }
            None => {
                tracing::debug!("Get {} for device {}", name, device_label);
                match device.get(name) {
                    Ok(value) => (Level::Info, value),
                    Err(e) => {
                        tracing::warn!("Get {} on {} failed: {}", name, device_label, e);
                        (
                            Level::Error,
                            format!("Failed to get `{}` for device `{}`", name, device_label),
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::protocol::{FieldValue, Record, Tags};
    use crate::topology::StaticTopology;
    use std::time::SystemTime;

    fn dispatcher() -> (Dispatcher, Arc<SimulatedBackend>) {
        let topology = StaticTopology::uniform(2, 4, 2);
        let backend = Arc::new(SimulatedBackend::new(&topology.topology().cpu_info));
        let dispatcher = Dispatcher::new("nodeA", backend.clone(), Arc::new(topology));
        (dispatcher, backend)
    }

    fn tags_of(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn get(name: &str, pairs: &[(&str, &str)]) -> ControlMessage {
        ControlMessage::new_get_control(name, tags_of(pairs), Tags::new(), SystemTime::now()).unwrap()
    }

    fn reply_of(dispatcher: &Dispatcher, request: &ControlMessage) -> (String, String) {
        let reply = dispatcher.handle(request).unwrap().expect("reply");
        assert!(reply.is_log());
        assert_eq!(reply.name(), request.name());
        assert_eq!(reply.tag(tags::HOSTNAME), Some("nodeA"));
        (
            reply.tag(tags::LEVEL).unwrap().to_string(),
            reply.log_value().unwrap(),
        )
    }

    #[test]
    fn test_route_of() {
        assert_eq!(Route::of("topology"), Route::Topology);
        assert_eq!(Route::of("controls"), Route::Catalog);
        assert_eq!(Route::of("rapl.pkg_limit_1"), Route::Knob("rapl.pkg_limit_1"));
    }

    #[test]
    fn test_non_local_is_dropped() {
        let (dispatcher, _) = dispatcher();
        let request = get("topology", &[("hostname", "nodeB")]);
        assert!(dispatcher.handle(&request).unwrap().is_none());
    }

    #[test]
    fn test_missing_hostname_is_handled_and_stamped() {
        let (dispatcher, _) = dispatcher();
        let (level, _) = reply_of(&dispatcher, &get("topology", &[]));
        assert_eq!(level, "INFO");
    }

    #[test]
    fn test_topology_reply() {
        let (dispatcher, _) = dispatcher();
        let (level, text) = reply_of(&dispatcher, &get("topology", &[("hostname", "nodeA")]));
        assert_eq!(level, "INFO");
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["hwthreads"].as_array().unwrap().len(), 16);
        assert_eq!(json["cpu_info"]["NumSockets"], 2);
    }

    #[test]
    fn test_catalog_reply() {
        let (dispatcher, _) = dispatcher();
        let (level, text) = reply_of(&dispatcher, &get("controls", &[("hostname", "nodeA")]));
        assert_eq!(level, "INFO");
        let list: ControlList = serde_json::from_str(&text).unwrap();
        let limit = list
            .controls
            .iter()
            .find(|c| c.category == "rapl" && c.name == "pkg_limit_1")
            .unwrap();
        assert_eq!(limit.device_type, "socket");
        assert_eq!(limit.methods, "ALL");
        assert!(list.controls.iter().any(|c| c.methods == "GET"));
    }

    #[test]
    fn test_missing_type() {
        let (dispatcher, _) = dispatcher();
        for name in ["rapl.pkg_limit_1", "no.such_knob"] {
            let (level, text) = reply_of(&dispatcher, &get(name, &[("type-id", "0")]));
            assert_eq!(level, "ERROR");
            assert!(text.contains("No 'type' tag"), "{}", text);
        }
    }

    #[test]
    fn test_missing_type_id() {
        let (dispatcher, _) = dispatcher();
        for device_type in ["socket", "hwthread", "core", "LLC"] {
            let (level, text) = reply_of(&dispatcher, &get("rapl.pkg_limit_1", &[("type", device_type)]));
            assert_eq!(level, "ERROR");
            assert!(text.contains("No 'type-id' tag"), "{}", text);
        }
    }

    #[test]
    fn test_node_needs_no_type_id() {
        let (dispatcher, _) = dispatcher();
        let (_, text) = reply_of(&dispatcher, &get("cpu_freq.boost", &[("type", "node")]));
        assert!(!text.contains("No 'type-id' tag"), "{}", text);
        assert!(!text.contains("Cannot create device"), "{}", text);
    }

    fn raw(name: &str, pairs: &[(&str, &str)]) -> ControlMessage {
        let record = Record::new(
            name,
            tags_of(pairs),
            [("value".to_string(), FieldValue::Float(0.0))].into(),
            SystemTime::now(),
        )
        .unwrap();
        ControlMessage::from_record(record)
    }

    #[test]
    fn test_bad_method() {
        let (dispatcher, _) = dispatcher();
        let request = raw("rapl.pkg_limit_1", &[("type", "socket"), ("type-id", "0")]);
        let (level, text) = reply_of(&dispatcher, &request);
        assert_eq!(level, "ERROR");
        assert!(text.contains("No 'method' tag"));

        let request = raw(
            "rapl.pkg_limit_1",
            &[("type", "socket"), ("type-id", "0"), ("method", "DELETE")],
        );
        let (level, text) = reply_of(&dispatcher, &request);
        assert_eq!(level, "ERROR");
        assert!(text.contains("Invalid 'method' tag"));
    }

    #[test]
    fn test_put_without_value() {
        let (dispatcher, _) = dispatcher();
        let record = Record::new(
            "rapl.pkg_limit_1",
            tags_of(&[("type", "socket"), ("type-id", "0"), ("method", "PUT")]),
            [("other".to_string(), FieldValue::Integer(1))].into(),
            SystemTime::now(),
        )
        .unwrap();
        let (level, text) = reply_of(&dispatcher, &ControlMessage::from_record(record));
        assert_eq!(level, "ERROR");
        assert!(text.contains("No 'value' field"));
    }

    #[test]
    fn test_put_then_get() {
        let (dispatcher, backend) = dispatcher();
        let addressing = tags_of(&[("hostname", "nodeA"), ("type", "socket"), ("type-id", "0")]);
        let put = ControlMessage::new_put_control(
            "rapl.pkg_limit_1",
            addressing.clone(),
            Tags::new(),
            200000000.0,
            SystemTime::now(),
        )
        .unwrap();
        let (level, _) = reply_of(&dispatcher, &put);
        assert_eq!(level, "INFO");

        let get = ControlMessage::new_get_control("rapl.pkg_limit_1", addressing, Tags::new(), SystemTime::now())
            .unwrap();
        let (level, text) = reply_of(&dispatcher, &get);
        assert_eq!(level, "INFO");
        assert_eq!(text, "200000000");
        assert_eq!(backend.open_device_count(), 0);
    }

    #[test]
    fn test_device_and_hardware_failures() {
        let (dispatcher, backend) = dispatcher();
        let (level, text) = reply_of(
            &dispatcher,
            &get("rapl.pkg_limit_1", &[("type", "socket"), ("type-id", "9")]),
        );
        assert_eq!(level, "ERROR");
        assert_eq!(text, "Cannot create device `socket/9`");

        let (_, text) = reply_of(
            &dispatcher,
            &get("rapl.pkg_limit_1", &[("type", "gpu"), ("type-id", "0")]),
        );
        assert_eq!(text, "Cannot create device `gpu/0`");

        let (level, text) = reply_of(
            &dispatcher,
            &get("no.such_knob", &[("type", "socket"), ("type-id", "1")]),
        );
        assert_eq!(level, "ERROR");
        assert_eq!(text, "Failed to get `no.such_knob` for device `socket/1`");

        let put = ControlMessage::new_put_control(
            "rapl.pkg_max_limit",
            tags_of(&[("type", "socket"), ("type-id", "1")]),
            Tags::new(),
            "1",
            SystemTime::now(),
        )
        .unwrap();
        let (level, text) = reply_of(&dispatcher, &put);
        assert_eq!(level, "ERROR");
        assert_eq!(text, "Failed to set `rapl.pkg_max_limit=1` for device `socket/1`");
        assert_eq!(backend.open_device_count(), 0);
    }

    #[test]
    fn test_meta_carried_to_reply() {
        let (dispatcher, _) = dispatcher();
        let meta = tags_of(&[("unit", "uW")]);
        let request = ControlMessage::new_get_control(
            "rapl.pkg_limit_1",
            tags_of(&[("type", "socket"), ("type-id", "0")]),
            meta.clone(),
            SystemTime::now(),
        )
        .unwrap();
        let reply = dispatcher.handle(&request).unwrap().unwrap();
        assert_eq!(reply.meta(), &meta);
    }
}
