//! Node Module Tests
//!
//! ## Test Scopes
//! - **Status**: lifecycle transitions and terminal states.
//! - **State**: role, controller and plan bookkeeping.
//! - **HTTP**: status endpoint handlers called directly.
//! - **Coordinator**: allocation, table maintenance and local fail-over with a real store.

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::client::processor::RequestProcessor;
    use crate::client::server::ClientConnections;
    use crate::election::types::NodeRole;
    use crate::membership::dispatcher::MessageDispatcher;
    use crate::membership::service::{LinkConfig, MembershipService};
    use crate::membership::types::{NodeDescriptor, NodeId};
    use crate::node::controller::PartitionCoordinator;
    use crate::node::http::{handle_servers, handle_slots, handle_status};
    use crate::node::state::ClusterState;
    use crate::node::status::{NodeStatus, StatusHandle};
    use crate::partition::table::PartitionTable;
    use crate::partition::types::{PartitionPlan, SLOT_COUNT, SlotAllocation, SlotRange};
    use crate::persist::{self, TableStore};
    use crate::protocol::client::InstanceAddress;
    use crate::replication::forwarder::ReplicationForwarder;

    struct Harness {
        state: Arc<ClusterState>,
        membership: Arc<MembershipService>,
        table: Arc<PartitionTable>,
        coordinator: Arc<PartitionCoordinator>,
        store: TableStore,
        status: StatusHandle,
        _dir: TempDir,
    }

    fn descriptor(id: i32, candidate: bool) -> NodeDescriptor {
        NodeDescriptor {
            node_id: NodeId(id),
            is_controller_candidate: candidate,
            ip: "127.0.0.1".to_string(),
            client_port: 7000 + id as u16,
        }
    }

    fn harness(id: i32, candidate: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let status = StatusHandle::new();
        let local = descriptor(id, candidate);
        let state = Arc::new(ClusterState::new(local.clone(), status.clone()));
        let (membership, _channels) =
            MembershipService::new(local, LinkConfig::default(), status.clone());
        let table = Arc::new(PartitionTable::new(ClientConnections::new()));
        let coordinator = PartitionCoordinator::new(
            state.clone(),
            membership.clone(),
            table.clone(),
            TableStore::new(dir.path()),
        );

        Harness {
            state,
            membership,
            table,
            coordinator,
            store: TableStore::new(dir.path()),
            status,
            _dir: dir,
        }
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..50 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    // ============================================================
    // STATUS TESTS
    // ============================================================

    #[test]
    fn test_status_starts_initializing_and_runs_once() {
        let status = StatusHandle::new();
        assert_eq!(status.get(), NodeStatus::Initializing);
        assert!(status.is_active());

        assert!(status.set_running());
        assert!(!status.set_running());
        assert_eq!(status.get(), NodeStatus::Running);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let status = StatusHandle::new();
        status.fatal("disk full");
        status.shutdown();
        assert_eq!(status.get(), NodeStatus::Fatal);
        assert!(!status.set_running());

        let other = StatusHandle::new();
        other.shutdown();
        assert!(!other.is_active());
        assert_eq!(other.get(), NodeStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_terminated_resolves_for_every_clone() {
        let status = StatusHandle::new();
        let observer = status.clone();
        let waiter = tokio::spawn(async move { observer.terminated().await });

        status.fatal("lost quorum");

        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, NodeStatus::Fatal);
        assert_eq!(status.terminated().await, NodeStatus::Fatal);
    }

    // ============================================================
    // STATE TESTS
    // ============================================================

    #[test]
    fn test_initial_role_follows_candidacy() {
        let candidate = ClusterState::new(descriptor(1, true), StatusHandle::new());
        let ordinary = ClusterState::new(descriptor(2, false), StatusHandle::new());

        assert_eq!(candidate.role(), NodeRole::Candidate);
        assert_eq!(ordinary.role(), NodeRole::Ordinary);
        assert_eq!(candidate.controller(), None);
        assert!(candidate.plan().is_none());

        candidate.set_role(NodeRole::Controller);
        candidate.set_controller(NodeId(1));
        assert!(candidate.is_controller());
        assert_eq!(candidate.controller(), Some(NodeId(1)));
    }

    #[test]
    fn test_update_plan_creates_missing_plan() {
        let state = ClusterState::new(descriptor(1, true), StatusHandle::new());

        let plan = state.update_plan(|plan| {
            plan.replica_node_ids.insert(NodeId(1), NodeId(2));
        });

        assert!(plan.slot_allocation.is_empty());
        assert_eq!(state.plan().unwrap().replica_of(NodeId(1)), Some(NodeId(2)));
    }

    // ============================================================
    // HTTP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_status_handler_reports_role() {
        let harness = harness(3, true);
        harness.state.set_role(NodeRole::Controller);
        harness.state.set_controller(NodeId(3));
        harness.status.set_running();

        let (code, Json(body)) = handle_status(Extension(harness.state.clone())).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.node_id, NodeId(3));
        assert_eq!(body.role, NodeRole::Controller);
        assert_eq!(body.status, NodeStatus::Running);
        assert_eq!(body.controller, Some(NodeId(3)));
    }

    #[tokio::test]
    async fn test_slots_handler_unavailable_until_initialized() {
        let harness = harness(1, false);

        let (code, _) = handle_slots(Extension(harness.table.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        harness.table.init_from_ranges(&[SlotRange::new(1, 100)]);
        harness.table.init_replicas_from_ranges(&[SlotRange::new(101, 200)]);
        harness.table.set_replica_node_id(Some(NodeId(2)));

        let (code, Json(body)) = handle_slots(Extension(harness.table.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.primary, vec![SlotRange::new(1, 100)]);
        assert_eq!(body.replica, vec![SlotRange::new(101, 200)]);
        assert_eq!(body.replica_node_id, Some(NodeId(2)));
    }

    #[tokio::test]
    async fn test_servers_handler_lists_local_node() {
        let harness = harness(4, false);
        let forwarder = ReplicationForwarder::new(harness.membership.clone(), harness.table.clone());
        let processor = RequestProcessor::new(
            harness.state.clone(),
            harness.membership.clone(),
            harness.table.clone(),
            forwarder,
        );

        let (code, Json(body)) = handle_servers(Extension(processor)).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.servers, vec!["4:127.0.0.1:7004".to_string()]);
    }

    // ============================================================
    // COORDINATOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_lone_controller_allocates_everything() {
        let harness = harness(5, true);

        let plan = harness.coordinator.allocate_and_distribute().await.unwrap();

        assert_eq!(
            plan.slot_allocation.get(&NodeId(5)),
            Some(&vec![SlotRange::new(1, SLOT_COUNT)])
        );
        assert!(plan.replica_node_ids.is_empty());
        assert_eq!(harness.table.primary_ranges(), vec![SlotRange::new(1, SLOT_COUNT)]);
        assert!(harness.table.replica_ranges().is_empty());
        assert_eq!(harness.state.plan(), Some(plan.clone()));

        let stored: Option<SlotAllocation> =
            harness.store.load(persist::SLOTS_ALLOCATION).await.unwrap();
        assert_eq!(stored, Some(plan.slot_allocation));
    }

    #[tokio::test]
    async fn test_maintenance_applies_controller_slices() {
        let harness = harness(2, false);
        let dispatcher = MessageDispatcher::new();
        let handle = harness
            .coordinator
            .start_maintenance(dispatcher.clone(), harness.status.clone());

        dispatcher.node_slots.push(vec![SlotRange::new(1, 8192)]);
        dispatcher
            .node_slots_replicas
            .push(vec![SlotRange::new(8193, SLOT_COUNT)]);
        dispatcher.replica_node_id.push(NodeId(1));
        dispatcher.controller_node_id.push(NodeId(1));

        let table = harness.table.clone();
        let state = harness.state.clone();
        assert!(
            eventually(|| table.is_initialized()
                && table.replica_node_id().is_some()
                && state.controller().is_some())
            .await
        );

        assert_eq!(harness.table.primary_ranges(), vec![SlotRange::new(1, 8192)]);
        assert_eq!(harness.state.controller(), Some(NodeId(1)));
        assert_eq!(harness.table.replica_node_id(), Some(NodeId(1)));

        let mut stored: Option<Vec<SlotRange>> = None;
        for _ in 0..50 {
            stored = harness.store.load(persist::NODE_SLOTS).await.unwrap();
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stored, Some(vec![SlotRange::new(1, 8192)]));

        harness.status.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_controller_takes_over_lost_node_locally() {
        let harness = harness(1, true);
        let own = SlotRange::new(1, 8192);
        let lost = SlotRange::new(8193, SLOT_COUNT);

        let mut plan = PartitionPlan::default();
        plan.slot_allocation.insert(NodeId(1), vec![own]);
        plan.slot_allocation.insert(NodeId(2), vec![lost]);
        plan.replica_allocation.insert(NodeId(1), vec![lost]);
        plan.replica_allocation.insert(NodeId(2), vec![own]);
        plan.replica_node_ids.insert(NodeId(1), NodeId(2));
        plan.replica_node_ids.insert(NodeId(2), NodeId(1));
        harness.state.set_plan(plan);

        harness.table.init_from_ranges(&[own]);
        harness.table.init_replicas_from_ranges(&[lost]);
        harness.table.set_replica_node_id(Some(NodeId(2)));

        let name = (0..)
            .map(|i| format!("svc-{}", i))
            .find(|name| lost.contains(crate::partition::table::slot_for(name)))
            .unwrap();
        harness
            .table
            .replica_shard(&name)
            .unwrap()
            .register(&InstanceAddress {
                service_name: name.clone(),
                ip: "10.0.0.2".to_string(),
                port: 80,
            });

        let changes = harness.coordinator.fail_over(NodeId(2)).await.unwrap();

        assert_eq!(changes.promoted, Some((NodeId(1), vec![lost])));
        assert!(changes.promoted_from_replica);
        assert_eq!(changes.unreplicated, vec![NodeId(1)]);

        assert_eq!(harness.table.primary_ranges(), vec![own, lost]);
        assert!(harness.table.replica_ranges().is_empty());
        assert_eq!(harness.table.replica_node_id(), None);
        assert_eq!(harness.table.shard(&name).unwrap().instance_count(), 1);

        let plan = harness.state.plan().unwrap();
        assert_eq!(plan.nodes(), vec![NodeId(1)]);

        let stored: Option<Vec<SlotRange>> =
            harness.store.load(persist::NODE_SLOTS).await.unwrap();
        assert_eq!(stored, Some(vec![own, lost]));
    }

    #[tokio::test]
    async fn test_fail_over_without_plan_is_ignored() {
        let harness = harness(1, true);

        assert!(harness.coordinator.fail_over(NodeId(2)).await.is_none());
        assert!(harness.coordinator.fail_over(NodeId(1)).await.is_none());
    }
}
