use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use super::controller::PartitionCoordinator;
use super::http;
use super::state::ClusterState;
use super::status::{NodeStatus, StatusHandle};
use crate::client::processor::RequestProcessor;
use crate::client::server::{ClientConnections, ClientServer};
use crate::config::NodeConfig;
use crate::election::coordinator::{ElectionCoordinator, PeerVoteChannel};
use crate::failover::service::FailoverService;
use crate::membership::dispatcher::MessageDispatcher;
use crate::membership::service::MembershipService;
use crate::partition::table::{PartitionTable, format_ranges};
use crate::persist::TableStore;
use crate::registry::expiry::ExpiryService;
use crate::replication::forwarder::ReplicationForwarder;

const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Every service of one running node.
pub struct ServerNode {
    pub config: NodeConfig,
    pub state: Arc<ClusterState>,
    pub membership: Arc<MembershipService>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub table: Arc<PartitionTable>,
    pub connections: Arc<ClientConnections>,
    pub processor: Arc<RequestProcessor>,
    pub coordinator: Arc<PartitionCoordinator>,
    pub election: Arc<ElectionCoordinator>,
    pub internal_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServerNode {
    /// Binds the configured ports and boots the node.
    pub async fn bind(config: NodeConfig) -> Result<Arc<Self>> {
        let internal = TcpListener::bind(("0.0.0.0", config.internal_port))
            .await
            .with_context(|| format!("binding internal port {}", config.internal_port))?;
        let client = TcpListener::bind(("0.0.0.0", config.client_port))
            .await
            .with_context(|| format!("binding client port {}", config.client_port))?;

        Self::start(config, internal, client).await
    }

    /// Boots the node on already bound listeners.
    ///
    /// Returns once the node has its slots and serves clients, or with an error if it
    /// stopped during boot.
    pub async fn start(
        config: NodeConfig,
        internal_listener: TcpListener,
        client_listener: TcpListener,
    ) -> Result<Arc<Self>> {
        let status = StatusHandle::new();
        let local = config.descriptor();
        info!(
            "Starting node {} (candidate: {}) at {}",
            local.node_id,
            local.is_controller_candidate,
            config.internal_addr()
        );

        let internal_addr = internal_listener.local_addr()?;
        let client_addr = client_listener.local_addr()?;

        // 1. Services:
        let state = Arc::new(ClusterState::new(local.clone(), status.clone()));
        let (membership, channels) =
            MembershipService::new(local, config.link_config(), status.clone());
        let dispatcher = MessageDispatcher::new();
        let connections = ClientConnections::new();
        let table = Arc::new(PartitionTable::new(connections.clone()));
        let store = TableStore::new(config.data_dir.clone());
        info!("Partition tables persist under {}", store.dir().display());
        let coordinator =
            PartitionCoordinator::new(state.clone(), membership.clone(), table.clone(), store);
        let election = Arc::new(ElectionCoordinator::new(
            state.node_id(),
            config.election_config(),
            status.clone(),
        ));
        let forwarder = ReplicationForwarder::new(membership.clone(), table.clone());
        let processor = RequestProcessor::new(
            state.clone(),
            membership.clone(),
            table.clone(),
            forwarder.clone(),
        );

        let mut tasks = Vec::new();

        // 2. Peer links:
        membership.start(internal_listener);
        tasks.push(dispatcher.clone().start(channels.inbound, status.clone()));
        tasks.push(coordinator.start_maintenance(dispatcher.clone(), status.clone()));

        let linked = membership
            .establish_links(
                &config.controller_candidate_servers,
                &config.internal_addr(),
                config.cluster_node_count,
            )
            .await;
        if !linked {
            return Err(boot_failed(&status, &tasks, "linking peers"));
        }

        // 3. Controller election:
        if state.local.is_controller_candidate {
            let candidates = membership.connected_candidates();
            let channel =
                PeerVoteChannel::new(membership.clone(), dispatcher.clone(), candidates.clone());

            match election.elect(&channel, candidates.len() + 1).await {
                Ok(outcome) => {
                    state.set_role(outcome.role);
                    state.set_controller(outcome.controller);
                }
                Err(e) => {
                    status.fatal(&e.to_string());
                    return Err(boot_failed(&status, &tasks, "electing the controller"));
                }
            }
        }

        // 4. Slot allocation:
        if state.is_controller() {
            if let Err(e) = coordinator.allocate_and_distribute().await {
                status.fatal(&format!("slot allocation failed: {:#}", e));
                return Err(boot_failed(&status, &tasks, "allocating slots"));
            }
        } else if !wait_for_slots(&state, &table).await {
            return Err(boot_failed(&status, &tasks, "waiting for slots"));
        }

        info!(
            "Node {} owns {} (replicas {}), controller is node {:?}",
            state.node_id(),
            format_ranges(&table.primary_ranges()),
            format_ranges(&table.replica_ranges()),
            state.controller()
        );

        // 5. Background services:
        let expiry = ExpiryService::new(table.clone(), config.expiry_config());
        tasks.push(expiry.start(status.clone()));
        tasks.push(forwarder.start(dispatcher.clone(), status.clone()));

        let failover = FailoverService::new(
            state.clone(),
            membership.clone(),
            dispatcher.clone(),
            election.clone(),
            coordinator.clone(),
        );
        tasks.push(failover.start(channels.disconnects));

        let client_server = ClientServer::new(
            processor.clone(),
            connections.clone(),
            table.clone(),
            status.clone(),
        );
        tasks.push(client_server.start(client_listener));

        // 6. Optional HTTP status port:
        let mut http_addr = None;
        if let Some(port) = config.client_http_port {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("binding HTTP port {}", port))?;
            http_addr = listener.local_addr().ok();
            let app = http::router(state.clone(), table.clone(), processor.clone());
            tasks.push(tokio::spawn(http::serve(listener, app, status.clone())));
        }

        if !status.set_running() {
            return Err(boot_failed(&status, &tasks, "starting client services"));
        }
        info!("Node {} is running", state.node_id());

        Ok(Arc::new(Self {
            config,
            state,
            membership,
            dispatcher,
            table,
            connections,
            processor,
            coordinator,
            election,
            internal_addr,
            client_addr,
            http_addr,
            tasks: parking_lot::Mutex::new(tasks),
        }))
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status()
    }

    /// Resolves when the node shuts down or fails.
    pub async fn wait_for_termination(&self) -> NodeStatus {
        self.state.status.terminated().await
    }

    /// Stops every loop and closes all peer links.
    pub fn shutdown(&self) {
        info!("Shutting down node {}", self.state.node_id());
        self.state.status.shutdown();
        self.membership.close_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Waits until the Controller has sent this node its slices and announced itself.
async fn wait_for_slots(state: &ClusterState, table: &PartitionTable) -> bool {
    let mut waited = Duration::ZERO;

    loop {
        if table.is_initialized() && state.controller().is_some() {
            return true;
        }
        if !state.status.is_active() {
            return false;
        }
        if waited >= Duration::from_secs(5) {
            info!("Still waiting for the controller's slot allocation");
            waited = Duration::ZERO;
        }
        tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        waited += BOOT_POLL_INTERVAL;
    }
}

fn boot_failed(status: &StatusHandle, tasks: &[JoinHandle<()>], stage: &str) -> anyhow::Error {
    for task in tasks {
        task.abort();
    }
    let current = status.get();
    if !current.is_terminal() {
        status.shutdown();
    }
    anyhow!("Node stopped while {} ({:?})", stage, current)
}
