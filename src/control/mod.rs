//! Control module - Both ends of the control protocol
//!
//! Provides:
//! - `Dispatcher`, routing one request to the topology, catalog or knob handler
//! - `ControlServer`, the node agent consuming requests from the bus
//! - `ControlClient`, issuing requests to a node and checking its replies

mod client;
mod dispatcher;
mod server;

pub use client::*;
pub use dispatcher::*;
pub use server::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::bus::{InProcessBus, MessageBus};
    use crate::protocol::{build_reply, request_subject, tags, ControlMessage, Level};
    use crate::topology::StaticTopology;
    use std::sync::Arc;
    use std::time::Duration;

    async fn node(bus: &InProcessBus, hostname: &str) -> ControlServer {
        let topology = StaticTopology::uniform(2, 4, 2);
        let backend = Arc::new(SimulatedBackend::new(&topology.topology().cpu_info));
        let dispatcher = Dispatcher::new(hostname, backend, Arc::new(topology));
        let mut server = ControlServer::new(
            dispatcher,
            Arc::new(bus.clone()),
            request_subject("cc-control", hostname),
        );
        server.start().await.unwrap();
        server
    }

    fn client(bus: &InProcessBus) -> ControlClient {
        ControlClient::new(Arc::new(bus.clone())).with_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_topology_query() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;

        let topology = client(&bus).get_topology("nodeA").await.unwrap();
        assert!(!topology.hwthreads.is_empty());
        assert_eq!(topology.cpu_info.num_hwthreads, topology.hwthreads.len());
    }

    #[tokio::test]
    async fn test_controls_query() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;

        let list = client(&bus).get_controls("nodeA").await.unwrap();
        assert!(list
            .controls
            .iter()
            .any(|c| c.category == "rapl" && c.name == "pkg_limit_1" && c.methods == "ALL"));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;
        let client = client(&bus);

        client
            .set_control_value("nodeA", "rapl.pkg_limit_1", "socket", Some("0"), "200000000")
            .await
            .unwrap();
        let value = client
            .get_control_value("nodeA", "rapl.pkg_limit_1", "socket", Some("0"))
            .await
            .unwrap();
        assert_eq!(value, "200000000");

        let untouched = client
            .get_control_value("nodeA", "rapl.pkg_limit_1", "socket", Some("1"))
            .await
            .unwrap();
        assert_eq!(untouched, "150000000");
    }

    #[tokio::test]
    async fn test_unknown_control() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;

        let err = client(&bus)
            .get_control_value("nodeA", "no.such_knob", "socket", Some("0"))
            .await
            .unwrap_err();
        match err {
            ClientError::Remote(text) => assert!(text.contains("Failed to get"), "{}", text),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_errors_are_surfaced() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;
        let client = client(&bus);

        let err = client
            .get_control_value("nodeA", "rapl.pkg_limit_1", "socket", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No 'type-id' tag"), "{}", err);

        let err = client
            .set_control_value("nodeA", "rapl.pkg_max_limit", "socket", Some("0"), "1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to set"), "{}", err);
    }

    #[tokio::test]
    async fn test_nodes_are_addressed_separately() {
        let bus = InProcessBus::new();
        let _a = node(&bus, "nodeA").await;
        let _b = node(&bus, "nodeB").await;
        let client = client(&bus);

        client
            .set_control_value("nodeB", "cpu_freq.governor", "hwthread", Some("3"), "powersave")
            .await
            .unwrap();
        let on_a = client
            .get_control_value("nodeA", "cpu_freq.governor", "hwthread", Some("3"))
            .await
            .unwrap();
        let on_b = client
            .get_control_value("nodeB", "cpu_freq.governor", "hwthread", Some("3"))
            .await
            .unwrap();
        assert_eq!(on_a, "performance");
        assert_eq!(on_b, "powersave");
    }

    #[tokio::test]
    async fn test_reply_from_wrong_host_is_rejected() {
        let bus = InProcessBus::new();
        // an impostor answering nodeA's subject with its own hostname
        let mut requests = bus.subscribe("cc-control.nodeA").await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(delivery) = requests.next().await {
                let request = ControlMessage::decode(&delivery.payload).unwrap().remove(0);
                let mut reply = build_reply(&request, Level::Info, "150000000").unwrap();
                reply.add_tag(tags::HOSTNAME, "nodeB").unwrap();
                if let Some(reply_to) = delivery.reply {
                    responder.publish(&reply_to, reply.encode()).await.unwrap();
                }
            }
        });

        let err = client(&bus)
            .get_control_value("nodeA", "rapl.pkg_limit_1", "socket", Some("0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HostMismatch { .. }));
    }

    #[tokio::test]
    async fn test_no_node_listening() {
        let bus = InProcessBus::new();
        let _server = node(&bus, "nodeA").await;

        let err = client(&bus).get_topology("nodeC").await.unwrap_err();
        assert!(matches!(err, ClientError::Request(_)));
    }
}
