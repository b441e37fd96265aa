//! Replication Module Tests
//!
//! ## Test Scopes
//! - **Apply**: replica shards take registrations and heartbeats silently.
//! - **Forward**: frames only go out when a linked replica holder is known.
//! - **End to end**: a primary's mutation reaches the replica shard of a linked node.

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use crate::membership::dispatcher::{MessageDispatcher, ReplicaKind, ReplicaRequest};
    use crate::membership::service::{LinkChannels, LinkConfig, MembershipService};
    use crate::membership::types::{NodeDescriptor, NodeId};
    use crate::node::status::StatusHandle;
    use crate::partition::table::PartitionTable;
    use crate::partition::types::{SLOT_COUNT, SlotRange};
    use crate::protocol::client::{ClientMessage, ClientRequest, InstanceAddress};
    use crate::registry::types::{ChangeNotifier, ConnectionId};
    use crate::replication::forwarder::{ApplyOutcome, ReplicationForwarder};

    #[derive(Default)]
    struct CountingNotifier {
        count: Mutex<usize>,
    }

    impl ChangeNotifier for CountingNotifier {
        fn notify(&self, _: ConnectionId, _: &str, _: &[String]) {
            *self.count.lock() += 1;
        }
    }

    fn descriptor(id: i32) -> NodeDescriptor {
        NodeDescriptor {
            node_id: NodeId(id),
            is_controller_candidate: true,
            ip: "127.0.0.1".to_string(),
            client_port: 7000 + id as u16,
        }
    }

    fn membership(id: i32, status: StatusHandle) -> (Arc<MembershipService>, LinkChannels) {
        MembershipService::new(descriptor(id), LinkConfig::default(), status)
    }

    fn replica_table(notifier: Arc<CountingNotifier>) -> Arc<PartitionTable> {
        let table = Arc::new(PartitionTable::new(notifier));
        table.init_from_ranges(&[]);
        table.init_replicas_from_ranges(&[SlotRange::new(1, SLOT_COUNT)]);
        table
    }

    fn address(port: u16) -> InstanceAddress {
        InstanceAddress {
            service_name: "orders".to_string(),
            ip: "10.0.0.1".to_string(),
            port,
        }
    }

    fn replica_request(kind: ReplicaKind, request: ClientRequest) -> ReplicaRequest {
        ReplicaRequest {
            from: NodeId(1),
            kind,
            message: ClientMessage::request(request),
        }
    }

    // ============================================================
    // APPLY TESTS
    // ============================================================

    #[test]
    fn test_apply_register_then_heartbeat() {
        let notifier = Arc::new(CountingNotifier::default());
        let table = replica_table(notifier.clone());
        table
            .replica_shard("orders")
            .unwrap()
            .subscribe("orders", ConnectionId(1));
        let (membership, _channels) = membership(2, StatusHandle::new());
        let forwarder = ReplicationForwarder::new(membership, table.clone());

        let register = replica_request(ReplicaKind::Register, ClientRequest::Register(address(80)));
        assert_eq!(forwarder.apply(register.clone()), ApplyOutcome::Registered);
        assert_eq!(forwarder.apply(register), ApplyOutcome::Refreshed);

        let heartbeat =
            replica_request(ReplicaKind::Heartbeat, ClientRequest::Heartbeat(address(80)));
        assert_eq!(forwarder.apply(heartbeat), ApplyOutcome::Refreshed);

        assert_eq!(
            table.replica_shard("orders").unwrap().addresses("orders"),
            vec!["orders,10.0.0.1,80".to_string()]
        );
        assert_eq!(*notifier.count.lock(), 0);
    }

    #[test]
    fn test_heartbeat_for_missing_instance_recovers_it() {
        let table = replica_table(Arc::new(CountingNotifier::default()));
        let (membership, _channels) = membership(2, StatusHandle::new());
        let forwarder = ReplicationForwarder::new(membership, table.clone());

        let heartbeat =
            replica_request(ReplicaKind::Heartbeat, ClientRequest::Heartbeat(address(81)));

        assert_eq!(forwarder.apply(heartbeat), ApplyOutcome::Recovered);
        assert_eq!(table.replica_shard("orders").unwrap().instance_count(), 1);
    }

    #[test]
    fn test_apply_without_replica_shard() {
        let table = Arc::new(PartitionTable::new(Arc::new(CountingNotifier::default())));
        table.init_from_ranges(&[SlotRange::new(1, SLOT_COUNT)]);
        table.init_replicas_from_ranges(&[]);
        let (membership, _channels) = membership(2, StatusHandle::new());
        let forwarder = ReplicationForwarder::new(membership, table.clone());

        let register = replica_request(ReplicaKind::Register, ClientRequest::Register(address(80)));

        assert_eq!(forwarder.apply(register), ApplyOutcome::NoReplicaShard);
        assert_eq!(table.shard("orders").unwrap().instance_count(), 0);
    }

    #[test]
    fn test_mismatched_kind_is_rejected() {
        let table = replica_table(Arc::new(CountingNotifier::default()));
        let (membership, _channels) = membership(2, StatusHandle::new());
        let forwarder = ReplicationForwarder::new(membership, table);

        let request = replica_request(
            ReplicaKind::Register,
            ClientRequest::Subscribe {
                service_name: "orders".to_string(),
            },
        );

        assert_eq!(forwarder.apply(request), ApplyOutcome::Rejected);
    }

    // ============================================================
    // FORWARD TESTS
    // ============================================================

    #[test]
    fn test_forward_needs_replica_holder() {
        let table = replica_table(Arc::new(CountingNotifier::default()));
        let (membership, _channels) = membership(1, StatusHandle::new());
        let forwarder = ReplicationForwarder::new(membership, table.clone());
        let message = ClientMessage::request(ClientRequest::Register(address(80)));

        assert!(!forwarder.forward(ReplicaKind::Register, &message));

        table.set_replica_node_id(Some(NodeId(2)));
        assert!(!forwarder.forward(ReplicaKind::Register, &message));
    }

    #[tokio::test]
    async fn test_forwarded_register_reaches_replica_node() {
        let primary_status = StatusHandle::new();
        let replica_status = StatusHandle::new();
        let (primary, _primary_channels) = membership(1, primary_status.clone());
        let (replica, replica_channels) = membership(2, replica_status.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let replica_addr = listener.local_addr().unwrap().to_string();
        replica.start(listener);

        let primary_table = Arc::new(PartitionTable::new(Arc::new(CountingNotifier::default())));
        primary_table.init_from_ranges(&[SlotRange::new(1, SLOT_COUNT)]);
        primary_table.set_replica_node_id(Some(NodeId(2)));
        let primary_forwarder = ReplicationForwarder::new(primary.clone(), primary_table);

        let replica_table = replica_table(Arc::new(CountingNotifier::default()));
        let dispatcher = MessageDispatcher::new();
        let _dispatch = dispatcher
            .clone()
            .start(replica_channels.inbound, replica_status.clone());
        let _apply = ReplicationForwarder::new(replica.clone(), replica_table.clone())
            .start(dispatcher, replica_status.clone());

        primary.connect(&replica_addr).await.unwrap();
        let message = ClientMessage::request(ClientRequest::Register(address(80)));
        assert!(primary_forwarder.forward(ReplicaKind::Register, &message));

        let shard = replica_table.replica_shard("orders").unwrap();
        let mut applied = false;
        for _ in 0..50 {
            if shard.instance_count() == 1 {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(applied, "replica never saw the registration");

        primary_status.shutdown();
        replica_status.shutdown();
    }
}
