//! Replication Forwarder
//!
//! ## Responsibilities
//! - **Forwarding**: after a primary shard applies a register or heartbeat, the unchanged
//!   client frame is wrapped in a replica frame and queued to this node's replica holder.
//!   The caller never waits for it.
//! - **Applying**: a background task consumes replica requests from peers and applies the
//!   same mutation to the matching replica shard, without notifying anyone.

use std::sync::Arc;

use crate::membership::dispatcher::{MessageDispatcher, ReplicaKind, ReplicaRequest};
use crate::membership::service::MembershipService;
use crate::node::status::StatusHandle;
use crate::partition::table::PartitionTable;
use crate::protocol::client::{ClientMessage, ClientPayload, ClientRequest};
use crate::protocol::frame::PeerMessage;
use crate::registry::types::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Registered,
    Refreshed,
    /// Heartbeat for an instance the replica never saw; it was added.
    Recovered,
    NoReplicaShard,
    Rejected,
}

pub struct ReplicationForwarder {
    membership: Arc<MembershipService>,
    table: Arc<PartitionTable>,
}

impl ReplicationForwarder {
    pub fn new(membership: Arc<MembershipService>, table: Arc<PartitionTable>) -> Arc<Self> {
        Arc::new(Self { membership, table })
    }

    /// Queues `message` for the replica holder of this node's ranges. Returns
    /// whether a frame was queued.
    pub fn forward(&self, kind: ReplicaKind, message: &ClientMessage) -> bool {
        let Some(replica) = self.table.replica_node_id() else {
            tracing::debug!("No replica holder assigned, not forwarding {:?}", kind);
            return false;
        };

        let peer_message = match kind {
            ReplicaKind::Register => PeerMessage::ReplicaRegister(message.clone()),
            ReplicaKind::Heartbeat => PeerMessage::ReplicaHeartbeat(message.clone()),
        };

        match self.membership.send(replica, &peer_message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to forward {:?} to replica node {}: {}", kind, replica, e);
                false
            }
        }
    }

    pub fn start(
        self: Arc<Self>,
        dispatcher: Arc<MessageDispatcher>,
        status: StatusHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    request = dispatcher.replica_requests.take() => request,
                    _ = status.terminated() => break,
                };

                match request {
                    Some(request) => {
                        self.apply(request);
                    }
                    None => break,
                }
            }
            tracing::debug!("Replica apply loop stopped");
        })
    }

    pub fn apply(&self, request: ReplicaRequest) -> ApplyOutcome {
        let ClientPayload::Request(client_request) = &request.message.payload else {
            tracing::warn!("Replica frame from node {} carries a response", request.from);
            return ApplyOutcome::Rejected;
        };

        match (request.kind, client_request) {
            (ReplicaKind::Register, ClientRequest::Register(address)) => {
                let Some(shard) = self.table.replica_shard(&address.service_name) else {
                    tracing::warn!(
                        "No replica shard for service {} (from node {})",
                        address.service_name,
                        request.from
                    );
                    return ApplyOutcome::NoReplicaShard;
                };

                if shard.register(address) {
                    ApplyOutcome::Registered
                } else {
                    ApplyOutcome::Refreshed
                }
            }
            (ReplicaKind::Heartbeat, ClientRequest::Heartbeat(address)) => {
                let Some(shard) = self.table.replica_shard(&address.service_name) else {
                    tracing::warn!(
                        "No replica shard for service {} (from node {})",
                        address.service_name,
                        request.from
                    );
                    return ApplyOutcome::NoReplicaShard;
                };

                match shard.heartbeat(address) {
                    Ok(()) => ApplyOutcome::Refreshed,
                    Err(RegistryError::NotRegistered(id)) => {
                        tracing::debug!("Replica missing {}, adding it from heartbeat", id);
                        shard.register(address);
                        ApplyOutcome::Recovered
                    }
                    Err(e) => {
                        tracing::warn!("Replica heartbeat failed: {}", e);
                        ApplyOutcome::Rejected
                    }
                }
            }
            (kind, other) => {
                tracing::warn!(
                    "Replica frame {:?} from node {} wraps unexpected request {:?}",
                    kind,
                    request.from,
                    other.request_type()
                );
                ApplyOutcome::Rejected
            }
        }
    }
}
