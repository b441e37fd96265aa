//! Cluster Integration Tests
//!
//! Boots small clusters on localhost and drives them through the registry client:
//! election, slot allocation, replication and fail-over. Most tests run three
//! controller candidates; one mixes a single candidate with ordinary nodes.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

use registry_cluster::client::connector::RegistryClient;
use registry_cluster::config::NodeConfig;
use registry_cluster::election::types::NodeRole;
use registry_cluster::membership::types::NodeId;
use registry_cluster::node::context::ServerNode;
use registry_cluster::node::status::NodeStatus;
use registry_cluster::partition::table::slot_for;
use registry_cluster::partition::types::SLOT_COUNT;
use registry_cluster::protocol::client::RequestResult;

struct Cluster {
    nodes: Vec<Arc<ServerNode>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    fn node(&self, id: i32) -> &Arc<ServerNode> {
        self.nodes
            .iter()
            .find(|node| node.state.node_id() == NodeId(id))
            .unwrap()
    }

    /// Node currently owning the slot of `service_name`.
    fn owner_of(&self, service_name: &str) -> &Arc<ServerNode> {
        self.nodes
            .iter()
            .find(|node| node.status() == NodeStatus::Running && node.table.shard(service_name).is_some())
            .unwrap()
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

async fn start_cluster(ids: &[i32]) -> Cluster {
    start_mixed_cluster(ids, &[]).await
}

/// Boots `candidates` and `ordinary` nodes together. Only candidates are on the roster.
async fn start_mixed_cluster(candidates: &[i32], ordinary: &[i32]) -> Cluster {
    let specs: Vec<(i32, bool)> = candidates
        .iter()
        .map(|id| (*id, true))
        .chain(ordinary.iter().map(|id| (*id, false)))
        .collect();

    let mut listeners = Vec::new();
    for _ in &specs {
        let internal = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listeners.push((internal, client));
    }

    let roster: Vec<String> = listeners
        .iter()
        .zip(&specs)
        .filter(|(_, (_, candidate))| *candidate)
        .map(|((internal, _), _)| internal.local_addr().unwrap().to_string())
        .collect();
    let roster_toml = roster
        .iter()
        .map(|addr| format!("\"{}\"", addr))
        .collect::<Vec<_>>()
        .join(", ");

    let mut dirs = Vec::new();
    let mut boots = Vec::new();
    for ((id, candidate), (internal, client)) in specs.iter().zip(listeners) {
        let dir = TempDir::new().unwrap();
        let raw = format!(
            r#"
node_id = {id}
node_ip = "127.0.0.1"
internal_port = {internal_port}
client_port = {client_port}
is_controller_candidate = {candidate}
cluster_node_count = {count}
controller_candidate_servers = [{roster}]
data_dir = "{data_dir}"
election_round_timeout_ms = 2000
heartbeat_timeout_period_secs = 30
"#,
            id = id,
            candidate = candidate,
            internal_port = internal.local_addr().unwrap().port(),
            client_port = client.local_addr().unwrap().port(),
            count = specs.len(),
            roster = roster_toml,
            data_dir = dir.path().display(),
        );
        let config = NodeConfig::from_toml_str(&raw).unwrap();
        dirs.push(dir);
        boots.push(tokio::spawn(ServerNode::start(config, internal, client)));
    }

    let mut nodes = Vec::new();
    for boot in boots {
        let node = tokio::time::timeout(Duration::from_secs(30), boot)
            .await
            .expect("node did not boot in time")
            .unwrap()
            .unwrap();
        nodes.push(node);
    }

    Cluster { nodes, _dirs: dirs }
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================
// BOOT TESTS
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_candidates_elect_and_split_slots() {
    let cluster = start_cluster(&[1, 2, 3]).await;

    for node in &cluster.nodes {
        assert_eq!(node.status(), NodeStatus::Running);
        assert_eq!(node.state.controller(), Some(NodeId(3)));
    }
    assert_eq!(cluster.node(3).state.role(), NodeRole::Controller);
    assert_eq!(cluster.node(1).state.role(), NodeRole::Candidate);

    let mut owned: Vec<_> = cluster
        .nodes
        .iter()
        .flat_map(|node| node.table.primary_ranges())
        .collect();
    owned.sort();
    assert_eq!(owned.first().unwrap().start, 1);
    assert_eq!(owned.last().unwrap().end, SLOT_COUNT);
    assert_eq!(owned.iter().map(|r| r.slot_count()).sum::<usize>(), SLOT_COUNT as usize);

    let plan = cluster.node(3).state.plan().unwrap();
    assert!(
        eventually(|| cluster.node(1).state.plan().as_ref() == Some(&plan)
            && cluster.node(2).state.plan().as_ref() == Some(&plan))
        .await
    );

    let client = RegistryClient::connect(&cluster.node(1).client_addr.to_string())
        .await
        .unwrap();
    assert_eq!(client.fetch_server_node_id().await.unwrap(), NodeId(1));
    assert_eq!(client.fetch_server_addresses().await.unwrap().len(), 3);
    assert_eq!(client.fetch_slots_allocation().await.unwrap(), plan.slot_allocation);

    cluster.shutdown();
}

// ============================================================
// REGISTRY TESTS
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_register_replicates_and_notifies() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let service = "orders";
    let owner = cluster.owner_of(service);
    let holder = cluster.node(owner.table.replica_node_id().unwrap().0);

    let watcher = RegistryClient::connect(&owner.client_addr.to_string())
        .await
        .unwrap();
    let worker = RegistryClient::connect(&owner.client_addr.to_string())
        .await
        .unwrap();

    assert!(watcher.subscribe(service).await.unwrap().is_empty());
    assert_eq!(
        worker.register(service, "10.1.0.5", 8080).await.unwrap(),
        RequestResult::Success
    );

    let change = watcher.next_change(Duration::from_secs(5)).await.unwrap();
    assert_eq!(change.service_name, service);
    assert_eq!(change.addresses, vec!["orders,10.1.0.5,8080".to_string()]);

    let replica = holder.table.replica_shard(service).unwrap();
    assert!(eventually(|| replica.instance_count() == 1).await);

    let other = cluster
        .nodes
        .iter()
        .find(|node| !Arc::ptr_eq(node, owner))
        .unwrap();
    let stray = RegistryClient::connect(&other.client_addr.to_string())
        .await
        .unwrap();
    assert_eq!(
        stray.register(service, "10.1.0.5", 8080).await.unwrap(),
        RequestResult::Failure
    );
    assert_eq!(slot_for(service), owner.table.route(service));

    cluster.shutdown();
}

// ============================================================
// FAIL-OVER TESTS
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_node_ranges_move_to_replica_holder() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let lost = cluster.node(1);
    let lost_ranges = lost.table.primary_ranges();
    let holder = cluster.node(lost.table.replica_node_id().unwrap().0);

    let name = (0..)
        .map(|i| format!("svc-{}", i))
        .find(|name| lost.table.shard(name).is_some())
        .unwrap();
    let client = RegistryClient::connect(&lost.client_addr.to_string())
        .await
        .unwrap();
    assert_eq!(
        client.register(&name, "10.1.0.9", 9000).await.unwrap(),
        RequestResult::Success
    );
    let replica = holder.table.replica_shard(&name).unwrap();
    assert!(eventually(|| replica.instance_count() == 1).await);
    drop(client);

    lost.shutdown();

    assert!(
        eventually(|| {
            let primaries = holder.table.primary_ranges();
            lost_ranges.iter().all(|range| primaries.contains(range))
        })
        .await,
        "replica holder never took over the lost ranges"
    );
    assert_eq!(holder.table.shard(&name).unwrap().instance_count(), 1);

    let controller = cluster.node(3);
    assert!(
        eventually(|| !controller
            .state
            .plan()
            .unwrap()
            .slot_allocation
            .contains_key(&NodeId(1)))
        .await
    );

    let client = RegistryClient::connect(&holder.client_addr.to_string())
        .await
        .unwrap();
    assert_eq!(
        client.heartbeat(&name, "10.1.0.9", 9000).await.unwrap(),
        RequestResult::Success
    );

    cluster.shutdown();
}

// ============================================================
// MIXED CLUSTER TESTS
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordinary_nodes_replicate_through_linked_holders() {
    let cluster = start_mixed_cluster(&[1], &[2, 3]).await;

    let controller = cluster.node(1);
    assert_eq!(controller.state.role(), NodeRole::Controller);
    for id in [2, 3] {
        let node = cluster.node(id);
        assert_eq!(node.status(), NodeStatus::Running);
        assert_eq!(node.state.role(), NodeRole::Ordinary);
        assert_eq!(node.state.controller(), Some(NodeId(1)));
        assert!(node.membership.is_connected(NodeId(1)));
    }

    let mut owned: Vec<_> = cluster
        .nodes
        .iter()
        .flat_map(|node| node.table.primary_ranges())
        .collect();
    owned.sort();
    assert_eq!(owned.iter().map(|r| r.slot_count()).sum::<usize>(), SLOT_COUNT as usize);

    let plan = controller.state.plan().unwrap();
    assert_eq!(plan.replica_of(NodeId(2)), Some(NodeId(1)));
    assert_eq!(plan.replica_of(NodeId(3)), Some(NodeId(1)));

    assert!(
        eventually(|| cluster.nodes.iter().all(|node| {
            let holder = node.table.replica_node_id();
            holder.is_some_and(|holder| node.membership.is_connected(holder))
        }))
        .await,
        "a node forwards replicas to a peer it has no link with"
    );

    for id in [2, 3] {
        let primary = cluster.node(id);
        let name = (0..)
            .map(|i| format!("svc-{}", i))
            .find(|name| primary.table.shard(name).is_some())
            .unwrap();

        let client = RegistryClient::connect(&primary.client_addr.to_string())
            .await
            .unwrap();
        assert_eq!(
            client.register(&name, "10.2.0.1", 7000).await.unwrap(),
            RequestResult::Success
        );

        let replica = controller.table.replica_shard(&name).unwrap();
        assert!(
            eventually(|| replica.instance_count() == 1).await,
            "registration on node {} never reached its replica holder",
            id
        );
    }

    cluster.shutdown();
}
