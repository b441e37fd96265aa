//! Membership Module Tests
//!
//! Validates the peer link layer and the dispatcher in front of it.
//!
//! ## Test Scopes
//! - **Handshake**: descriptor layout and both sides of the exchange.
//! - **Dispatcher**: tag routing, dropping unknown or malformed frames, queue timeouts.
//! - **Links**: two services on localhost linking, exchanging frames and reporting a lost peer.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use crate::election::types::Vote;
    use crate::membership::dispatcher::{MessageDispatcher, MessageQueue, ReplicaKind};
    use crate::membership::handshake::{accept, dial, encode_descriptor, read_descriptor};
    use crate::membership::service::{LinkChannels, LinkConfig, MembershipService};
    use crate::membership::types::{InboundFrame, LinkError, NodeDescriptor, NodeId};
    use crate::node::status::StatusHandle;
    use crate::partition::types::SlotRange;
    use crate::protocol::client::{ClientMessage, ClientRequest};
    use crate::protocol::frame::{PeerFrame, PeerMessage};

    fn descriptor(id: i32, candidate: bool) -> NodeDescriptor {
        NodeDescriptor {
            node_id: NodeId(id),
            is_controller_candidate: candidate,
            ip: "127.0.0.1".to_string(),
            client_port: 6000 + id as u16,
        }
    }

    fn test_link_config() -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(60),
        }
    }

    async fn start_service(
        id: i32,
    ) -> (Arc<MembershipService>, LinkChannels, String, StatusHandle) {
        let status = StatusHandle::new();
        let (service, channels) =
            MembershipService::new(descriptor(id, true), test_link_config(), status.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        service.start(listener);
        (service, channels, addr, status)
    }

    // ============================================================
    // HANDSHAKE TESTS
    // ============================================================

    #[test]
    fn test_descriptor_layout() {
        let encoded = encode_descriptor(&NodeDescriptor {
            node_id: NodeId(3),
            is_controller_candidate: true,
            ip: "10.0.0.1".to_string(),
            client_port: 7000,
        });

        let mut expected = vec![0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 8];
        expected.extend_from_slice(b"10.0.0.1");
        expected.extend_from_slice(&7000i32.to_be_bytes());
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_handshake_exchanges_descriptors() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let left = descriptor(1, true);
        let right = descriptor(2, false);

        let (dialed, accepted) = tokio::join!(
            dial(&mut a, &left, Duration::from_secs(1), "right"),
            accept(&mut b, &right, Duration::from_secs(1), "left"),
        );

        assert_eq!(dialed.unwrap(), right);
        assert_eq!(accepted.unwrap(), left);
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_candidate_flag() {
        let mut raw = vec![0, 0, 0, 1, 0, 0, 0, 5];
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 80]);
        let mut reader = raw.as_slice();

        assert!(read_descriptor(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_answer() {
        let (mut a, _b) = tokio::io::duplex(1024);

        let err = dial(&mut a, &descriptor(1, true), Duration::from_millis(50), "silent")
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::Handshake { .. }));
    }

    // ============================================================
    // DISPATCHER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_dispatcher_routes_by_tag() {
        let dispatcher = MessageDispatcher::new();
        let vote = Vote {
            voter_node_id: NodeId(1),
            controller_node_id: NodeId(1),
            round: 1,
        };

        for message in [
            PeerMessage::Vote(vote),
            PeerMessage::NodeSlots(vec![SlotRange::new(1, 100)]),
            PeerMessage::ControllerNodeId(NodeId(3)),
            PeerMessage::PromoteReplicas(vec![SlotRange::new(101, 200)]),
        ] {
            dispatcher.dispatch(InboundFrame {
                from: NodeId(1),
                frame: message.encode().unwrap(),
            });
        }

        let timeout = Duration::from_millis(100);
        assert_eq!(dispatcher.votes.take_timeout(timeout).await, Some(vote));
        assert_eq!(
            dispatcher.node_slots.take_timeout(timeout).await,
            Some(vec![SlotRange::new(1, 100)])
        );
        assert_eq!(
            dispatcher.controller_node_id.take_timeout(timeout).await,
            Some(NodeId(3))
        );
        assert_eq!(
            dispatcher.promote_replicas.take_timeout(timeout).await,
            Some(vec![SlotRange::new(101, 200)])
        );
        assert!(dispatcher.replica_node_id.drain().is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_tags_replica_requests_with_sender() {
        let dispatcher = MessageDispatcher::new();
        let request = ClientMessage::request(ClientRequest::Subscribe {
            service_name: "orders".to_string(),
        });

        dispatcher.dispatch(InboundFrame {
            from: NodeId(4),
            frame: PeerMessage::ReplicaHeartbeat(request.clone()).encode().unwrap(),
        });

        let forwarded = dispatcher
            .replica_requests
            .take_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(forwarded.from, NodeId(4));
        assert_eq!(forwarded.kind, ReplicaKind::Heartbeat);
        assert_eq!(forwarded.message, request);
    }

    #[test]
    fn test_dispatcher_drops_unknown_and_malformed_frames() {
        let dispatcher = MessageDispatcher::new();

        dispatcher.dispatch(InboundFrame {
            from: NodeId(1),
            frame: PeerFrame {
                message_type: 77,
                payload: Bytes::from_static(b"junk"),
            },
        });
        dispatcher.dispatch(InboundFrame {
            from: NodeId(1),
            frame: PeerFrame {
                message_type: 1,
                payload: Bytes::from_static(b"ab"),
            },
        });

        assert!(dispatcher.votes.drain().is_empty());
    }

    #[tokio::test]
    async fn test_queue_take_timeout_and_drain() {
        let queue: MessageQueue<u32> = MessageQueue::new();

        assert_eq!(queue.take_timeout(Duration::from_millis(20)).await, None);

        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
    }

    // ============================================================
    // LINK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_two_nodes_link_and_exchange_frames() {
        let (a, mut a_channels, _a_addr, _a_status) = start_service(1).await;
        let (b, mut b_channels, b_addr, _b_status) = start_service(2).await;

        let remote = a.connect(&b_addr).await.unwrap();
        assert_eq!(remote.node_id, NodeId(2));
        assert!(a.is_connected(NodeId(2)));
        assert!(
            b.wait_until("node 1", |m| m.is_connected(NodeId(1)))
                .await
        );
        assert_eq!(b.peer(NodeId(1)).unwrap().client_port, 6001);

        a.send(NodeId(2), &PeerMessage::ControllerNodeId(NodeId(1)))
            .unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(2), b_channels.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from, NodeId(1));
        assert_eq!(
            PeerMessage::decode(&inbound.frame).unwrap(),
            PeerMessage::ControllerNodeId(NodeId(1))
        );

        let sent = b.broadcast(vec![NodeId(1), NodeId(9)], &PeerMessage::ReplicaNodeId(NodeId(2)));
        assert_eq!(sent, 1);
        let inbound = tokio::time::timeout(Duration::from_secs(2), a_channels.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from, NodeId(2));
    }

    #[tokio::test]
    async fn test_lost_peer_is_reported() {
        let (a, _a_channels, _a_addr, _a_status) = start_service(1).await;
        let (b, mut b_channels, b_addr, _b_status) = start_service(2).await;

        a.connect(&b_addr).await.unwrap();
        assert!(
            b.wait_until("node 1", |m| m.is_connected(NodeId(1)))
                .await
        );

        a.close_all();

        let lost = tokio::time::timeout(Duration::from_secs(2), b_channels.disconnects.recv())
            .await
            .unwrap();
        assert_eq!(lost, Some(NodeId(1)));
        assert!(!b.is_connected(NodeId(1)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_node_fails() {
        let (a, _channels, _addr, _status) = start_service(1).await;

        assert!(matches!(
            a.send(NodeId(5), &PeerMessage::ControllerNodeId(NodeId(1))),
            Err(LinkError::NotConnected(NodeId(5)))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_parked() {
        let (a, _channels, _addr, status) = start_service(1).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(a.connect_or_park(&dead).await.is_none());
        assert_eq!(a.parked_count(), 1);
        assert!(status.is_active());
    }
}
