use std::sync::Arc;

use crate::membership::dispatcher::ReplicaKind;
use crate::membership::service::MembershipService;
use crate::node::state::ClusterState;
use crate::partition::table::PartitionTable;
use crate::protocol::client::{
    ClientMessage, ClientPayload, ClientRequest, ClientResponse, InstanceAddress, RequestResult,
};
use crate::registry::types::{ConnectionId, RegistryError};
use crate::replication::forwarder::ReplicationForwarder;

/// Turns client requests into responses against the local partition table.
pub struct RequestProcessor {
    state: Arc<ClusterState>,
    membership: Arc<MembershipService>,
    table: Arc<PartitionTable>,
    forwarder: Arc<ReplicationForwarder>,
}

impl RequestProcessor {
    pub fn new(
        state: Arc<ClusterState>,
        membership: Arc<MembershipService>,
        table: Arc<PartitionTable>,
        forwarder: Arc<ReplicationForwarder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            membership,
            table,
            forwarder,
        })
    }

    /// Returns the response to send back, or `None` when the frame needs no answer.
    pub fn process(&self, connection_id: ConnectionId, message: &ClientMessage) -> Option<ClientMessage> {
        let ClientPayload::Request(request) = &message.payload else {
            return None;
        };

        let response = match request {
            ClientRequest::FetchSlotsAllocation => ClientResponse::SlotsAllocation(
                self.state
                    .plan()
                    .map(|plan| plan.slot_allocation)
                    .unwrap_or_default(),
            ),
            ClientRequest::FetchServerAddresses => {
                ClientResponse::ServerAddresses(self.server_addresses())
            }
            ClientRequest::FetchServerNodeId => ClientResponse::ServerNodeId(self.state.node_id()),
            ClientRequest::Register(address) => {
                ClientResponse::Register(self.register(address, message))
            }
            ClientRequest::Heartbeat(address) => {
                ClientResponse::Heartbeat(self.heartbeat(address, message))
            }
            ClientRequest::Subscribe { service_name } => {
                ClientResponse::Subscribe(self.subscribe(service_name, connection_id))
            }
            ClientRequest::ServiceChanged { service_name, .. } => {
                tracing::warn!(
                    "Client {} sent a service-changed request for {}; ignoring",
                    connection_id,
                    service_name
                );
                return None;
            }
        };

        Some(ClientMessage::response(message.id, response))
    }

    /// `"nodeId:ip:clientPort"` for every linked node and this one, by node id.
    pub fn server_addresses(&self) -> Vec<String> {
        let mut nodes = self.membership.peers();
        nodes.push(self.state.local.clone());
        nodes.sort_by_key(|node| node.node_id);
        nodes.iter().map(|node| node.server_address()).collect()
    }

    fn register(&self, address: &InstanceAddress, message: &ClientMessage) -> RequestResult {
        let Some(shard) = self.table.shard(&address.service_name) else {
            self.log_not_owned(&address.service_name);
            return RequestResult::Failure;
        };

        shard.register(address);
        self.forwarder.forward(ReplicaKind::Register, message);
        RequestResult::Success
    }

    fn heartbeat(&self, address: &InstanceAddress, message: &ClientMessage) -> RequestResult {
        let Some(shard) = self.table.shard(&address.service_name) else {
            self.log_not_owned(&address.service_name);
            return RequestResult::Failure;
        };

        match shard.heartbeat(address) {
            Ok(()) => {
                self.forwarder.forward(ReplicaKind::Heartbeat, message);
                RequestResult::Success
            }
            Err(RegistryError::NotRegistered(id)) => {
                tracing::debug!("Heartbeat for unknown instance {}", id);
                RequestResult::NotRegistered
            }
            Err(e) => {
                tracing::warn!("Heartbeat rejected: {}", e);
                RequestResult::Failure
            }
        }
    }

    fn subscribe(&self, service_name: &str, connection_id: ConnectionId) -> Vec<String> {
        match self.table.shard(service_name) {
            Some(shard) => shard.subscribe(service_name, connection_id),
            None => {
                self.log_not_owned(service_name);
                Vec::new()
            }
        }
    }

    fn log_not_owned(&self, service_name: &str) {
        let error = RegistryError::NotOwned {
            service_name: service_name.to_string(),
            slot: self.table.route(service_name),
        };
        tracing::warn!("Rejecting request: {}", error);
    }
}
