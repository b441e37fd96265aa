//! Message Dispatcher
//!
//! A single task drains the inbound frame channel fed by every peer reader and
//! routes each frame into a typed queue by its 4-byte type tag. Consumers block on
//! `take` or `take_timeout`; nothing is processed on the dispatcher task itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::types::{InboundFrame, NodeId};
use crate::election::types::Vote;
use crate::node::status::StatusHandle;
use crate::partition::types::{ReplicaAllocation, ReplicaNodeIds, SlotAllocation, SlotRange};
use crate::protocol::client::ClientMessage;
use crate::protocol::frame::{MessageType, PeerMessage};

/// Unbounded FIFO with a blocking, cancel-safe `take`.
pub struct MessageQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, item: T) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(item);
    }

    pub async fn take(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    pub async fn take_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.take()).await.ok().flatten()
    }

    /// Removes everything currently queued without waiting.
    #[cfg(test)]
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(item) = rx.try_recv() {
                drained.push(item);
            }
        }
        drained
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaKind {
    Register,
    Heartbeat,
}

/// A client mutation forwarded by a primary to this node's replica shard.
#[derive(Debug, Clone)]
pub struct ReplicaRequest {
    pub from: NodeId,
    pub kind: ReplicaKind,
    pub message: ClientMessage,
}

#[derive(Default)]
pub struct MessageDispatcher {
    pub votes: MessageQueue<Vote>,
    pub slots_allocation: MessageQueue<SlotAllocation>,
    pub slots_replica_allocation: MessageQueue<ReplicaAllocation>,
    pub replica_node_ids: MessageQueue<ReplicaNodeIds>,
    pub node_slots: MessageQueue<Vec<SlotRange>>,
    pub node_slots_replicas: MessageQueue<Vec<SlotRange>>,
    pub replica_node_id: MessageQueue<NodeId>,
    pub controller_node_id: MessageQueue<NodeId>,
    pub replica_requests: MessageQueue<ReplicaRequest>,
    pub promote_replicas: MessageQueue<Vec<SlotRange>>,
    pub assign_replicas: MessageQueue<Vec<SlotRange>>,
}

impl MessageDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
        status: StatusHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = inbound.recv() => frame,
                    _ = status.terminated() => break,
                };

                match frame {
                    Some(frame) => self.dispatch(frame),
                    None => break,
                }
            }
            tracing::debug!("Dispatcher stopped");
        })
    }

    pub fn dispatch(&self, inbound: InboundFrame) {
        let from = inbound.from;

        if MessageType::from_i32(inbound.frame.message_type).is_none() {
            tracing::warn!(
                "Dropping frame with unknown type {} from node {}",
                inbound.frame.message_type,
                from
            );
            return;
        }

        let message = match PeerMessage::decode(&inbound.frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed frame (type {}) from node {}: {}",
                    inbound.frame.message_type,
                    from,
                    e
                );
                return;
            }
        };

        tracing::debug!("Dispatching {:?} from node {}", message.message_type(), from);

        match message {
            PeerMessage::Vote(vote) => self.votes.push(vote),
            PeerMessage::SlotsAllocation(table) => self.slots_allocation.push(table),
            PeerMessage::SlotsReplicaAllocation(table) => self.slots_replica_allocation.push(table),
            PeerMessage::ReplicaNodeIds(table) => self.replica_node_ids.push(table),
            PeerMessage::NodeSlots(ranges) => self.node_slots.push(ranges),
            PeerMessage::NodeSlotsReplicas(ranges) => self.node_slots_replicas.push(ranges),
            PeerMessage::ReplicaNodeId(node_id) => self.replica_node_id.push(node_id),
            PeerMessage::ControllerNodeId(node_id) => self.controller_node_id.push(node_id),
            PeerMessage::ReplicaRegister(message) => self.replica_requests.push(ReplicaRequest {
                from,
                kind: ReplicaKind::Register,
                message,
            }),
            PeerMessage::ReplicaHeartbeat(message) => self.replica_requests.push(ReplicaRequest {
                from,
                kind: ReplicaKind::Heartbeat,
                message,
            }),
            PeerMessage::PromoteReplicas(ranges) => self.promote_replicas.push(ranges),
            PeerMessage::AssignReplicas(ranges) => self.assign_replicas.push(ranges),
            PeerMessage::Terminate => {
                tracing::debug!("Ignoring terminate frame from node {}", from);
            }
        }
    }
}
