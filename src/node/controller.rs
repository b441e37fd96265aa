//! Partition Coordination
//!
//! Owns the life cycle of the partition tables on this node.
//!
//! ## Responsibilities
//! - **Allocation** (Controller): plan slots and replicas, persist the full tables, send them
//!   to the other candidates and each node's slice to that node.
//! - **Maintenance** (every node): apply tables, slices, promotions and replica assignments
//!   received from the Controller, persisting what this node must keep.
//! - **Fail-over** (Controller): when a node is lost, promote its replica holder and
//!   re-home replicas, then push the changes out.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::state::ClusterState;
use crate::membership::dispatcher::MessageDispatcher;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::node::status::StatusHandle;
use crate::partition::planner;
use crate::partition::table::{PartitionTable, format_ranges};
use crate::partition::types::{
    FailoverChanges, PartitionPlan, ReplicaAllocation, ReplicaNodeIds, SlotAllocation, SlotRange,
};
use crate::persist::{self, PersistenceError, TableStore};
use crate::protocol::frame::PeerMessage;

pub struct PartitionCoordinator {
    state: Arc<ClusterState>,
    membership: Arc<MembershipService>,
    table: Arc<PartitionTable>,
    store: TableStore,
}

impl PartitionCoordinator {
    pub fn new(
        state: Arc<ClusterState>,
        membership: Arc<MembershipService>,
        table: Arc<PartitionTable>,
        store: TableStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            membership,
            table,
            store,
        })
    }

    fn self_id(&self) -> NodeId {
        self.state.node_id()
    }

    /// This node and every linked controller candidate.
    fn candidate_ids(&self) -> BTreeSet<NodeId> {
        let mut ids: BTreeSet<NodeId> = self.membership.connected_candidates().into_iter().collect();
        ids.insert(self.self_id());
        ids
    }

    /// Controller start-up path: plan, persist, install and distribute.
    pub async fn allocate_and_distribute(&self) -> anyhow::Result<PartitionPlan> {
        let self_id = self.self_id();
        let others = self.membership.peer_ids();
        let candidates = self.candidate_ids();

        let plan = {
            let mut rng = rand::thread_rng();
            planner::plan(self_id, &others, &candidates, &mut rng)?
        };

        info!(
            "Allocated {} slot range(s) across {} node(s)",
            plan.slot_allocation.values().map(Vec::len).sum::<usize>(),
            plan.slot_allocation.len()
        );
        for (node_id, ranges) in &plan.slot_allocation {
            info!(
                "  - node {} primary {} replica-holder {}",
                node_id,
                format_ranges(ranges),
                plan.replica_of(*node_id)
                    .map_or_else(|| "none".to_string(), |id| id.to_string())
            );
        }

        self.persist_plan(&plan).await?;
        self.state.set_plan(plan.clone());
        self.sync_tables_to_candidates(&plan);

        self.table.init_from_ranges(&plan.node_slots(self_id));
        self.table
            .init_replicas_from_ranges(&plan.node_replica_slots(self_id));
        self.table.set_replica_node_id(plan.replica_of(self_id));

        for peer in self.membership.peers() {
            self.send_slice(&plan, peer.node_id);
        }

        let ordinary: Vec<NodeId> = self
            .membership
            .peers()
            .into_iter()
            .filter(|peer| !peer.is_controller_candidate)
            .map(|peer| peer.node_id)
            .collect();
        self.membership
            .broadcast(ordinary, &PeerMessage::ControllerNodeId(self_id));

        Ok(plan)
    }

    fn send_slice(&self, plan: &PartitionPlan, node_id: NodeId) {
        let mut messages = vec![
            PeerMessage::NodeSlots(plan.node_slots(node_id)),
            PeerMessage::NodeSlotsReplicas(plan.node_replica_slots(node_id)),
        ];
        if let Some(replica) = plan.replica_of(node_id) {
            messages.push(PeerMessage::ReplicaNodeId(replica));
        }

        for message in messages {
            if let Err(e) = self.membership.send(node_id, &message) {
                tracing::warn!(
                    "Failed to send {:?} to node {}: {}",
                    message.message_type(),
                    node_id,
                    e
                );
            }
        }
    }

    /// Persists all three tables. Failure marks the node `Fatal`.
    pub async fn persist_plan(&self, plan: &PartitionPlan) -> Result<(), PersistenceError> {
        let result = async {
            self.store
                .persist(persist::SLOTS_ALLOCATION, &plan.slot_allocation)
                .await?;
            self.store
                .persist(persist::SLOTS_REPLICA_ALLOCATION, &plan.replica_allocation)
                .await?;
            self.store
                .persist(persist::REPLICA_NODE_IDS, &plan.replica_node_ids)
                .await
        }
        .await;

        self.fatal_on_error(result)
    }

    /// Persists this node's own primary and replica ranges.
    pub async fn persist_local_slices(&self) -> Result<(), PersistenceError> {
        let result = async {
            self.store
                .persist(persist::NODE_SLOTS, &self.table.primary_ranges())
                .await?;
            self.store
                .persist(persist::NODE_SLOTS_REPLICAS, &self.table.replica_ranges())
                .await
        }
        .await;

        self.fatal_on_error(result)
    }

    fn fatal_on_error(&self, result: Result<(), PersistenceError>) -> Result<(), PersistenceError> {
        if let Err(e) = &result {
            self.state
                .status
                .fatal(&format!("failed to persist partition tables: {}", e));
        }
        result
    }

    pub fn sync_tables_to_candidates(&self, plan: &PartitionPlan) {
        let candidates = self.membership.connected_candidates();
        if candidates.is_empty() {
            return;
        }

        self.membership.broadcast(
            candidates.iter().copied(),
            &PeerMessage::SlotsAllocation(plan.slot_allocation.clone()),
        );
        self.membership.broadcast(
            candidates.iter().copied(),
            &PeerMessage::SlotsReplicaAllocation(plan.replica_allocation.clone()),
        );
        self.membership.broadcast(
            candidates.iter().copied(),
            &PeerMessage::ReplicaNodeIds(plan.replica_node_ids.clone()),
        );
    }

    /// Removes `lost` from the plan and pushes the resulting changes. Controller only.
    pub async fn fail_over(&self, lost: NodeId) -> Option<FailoverChanges> {
        let self_id = self.self_id();
        let Some(mut plan) = self.state.plan() else {
            tracing::warn!("No partition plan available to fail over node {}", lost);
            return None;
        };

        if lost == self_id || !plan.slot_allocation.contains_key(&lost) {
            tracing::debug!("Node {} holds no slots, nothing to fail over", lost);
            return None;
        }

        let candidates = self.candidate_ids();
        let changes = {
            let mut rng = rand::thread_rng();
            plan.fail_over(lost, self_id, &candidates, &mut rng)
        };

        if self.persist_plan(&plan).await.is_err() {
            return None;
        }
        self.state.set_plan(plan.clone());

        self.apply_changes(&changes).await;
        self.sync_tables_to_candidates(&plan);

        Some(changes)
    }

    async fn apply_changes(&self, changes: &FailoverChanges) {
        let self_id = self.self_id();
        let mut local_changed = false;

        if let Some((target, ranges)) = &changes.promoted {
            info!(
                "Node {} takes over {} from node {}{}",
                target,
                format_ranges(ranges),
                changes.lost.map_or_else(String::new, |id| id.to_string()),
                if changes.promoted_from_replica {
                    ""
                } else {
                    " (no replica, starting empty)"
                }
            );

            if *target == self_id {
                self.table.promote(ranges);
                local_changed = true;
            } else if let Err(e) = self
                .membership
                .send(*target, &PeerMessage::PromoteReplicas(ranges.clone()))
            {
                tracing::error!("Failed to send promotion to node {}: {}", target, e);
            }
        }

        for (holder, ranges) in &changes.new_replicas {
            info!("Node {} now holds replicas {}", holder, format_ranges(ranges));
            if *holder == self_id {
                self.table.add_replica_ranges(ranges);
                local_changed = true;
            } else if let Err(e) = self
                .membership
                .send(*holder, &PeerMessage::AssignReplicas(ranges.clone()))
            {
                tracing::error!("Failed to assign replicas to node {}: {}", holder, e);
            }
        }

        for (primary, holder) in &changes.replica_node_id_changes {
            if *primary == self_id {
                self.table.set_replica_node_id(Some(*holder));
            } else if let Err(e) = self
                .membership
                .send(*primary, &PeerMessage::ReplicaNodeId(*holder))
            {
                tracing::error!("Failed to update replica holder of node {}: {}", primary, e);
            }
        }

        for primary in &changes.unreplicated {
            tracing::warn!("Node {} is left without a replica holder", primary);
            if *primary == self_id {
                self.table.set_replica_node_id(None);
            }
        }

        if local_changed {
            let _ = self.persist_local_slices().await;
        }
    }

    /// Called on a newly elected Controller: announce itself and fail over every
    /// planned node that is no longer linked, the previous Controller included.
    pub async fn take_over(&self, previous: NodeId) {
        let self_id = self.self_id();
        info!("Taking over as controller from node {}", previous);

        self.membership.broadcast(
            self.membership.peer_ids(),
            &PeerMessage::ControllerNodeId(self_id),
        );

        let Some(plan) = self.state.plan() else {
            tracing::error!("No partition tables were received before take-over");
            return;
        };

        let lost: Vec<NodeId> = plan
            .nodes()
            .into_iter()
            .filter(|node_id| *node_id != self_id && !self.membership.is_connected(*node_id))
            .collect();

        for node_id in lost {
            self.fail_over(node_id).await;
        }
    }

    /// Spawns the consumer of table updates sent by the Controller.
    pub fn start_maintenance(
        self: &Arc<Self>,
        dispatcher: Arc<MessageDispatcher>,
        status: StatusHandle,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            let d = dispatcher;
            loop {
                tokio::select! {
                    biased;
                    _ = status.terminated() => break,
                    Some(ranges) = d.node_slots.take() => coordinator.apply_node_slots(ranges).await,
                    Some(ranges) = d.node_slots_replicas.take() => {
                        coordinator.apply_node_slots_replicas(ranges).await
                    }
                    Some(ranges) = d.promote_replicas.take() => coordinator.apply_promotion(ranges).await,
                    Some(ranges) = d.assign_replicas.take() => {
                        coordinator.apply_replica_assignment(ranges).await
                    }
                    Some(node_id) = d.replica_node_id.take() => {
                        coordinator.table.set_replica_node_id(Some(node_id));
                        info!("Replica holder for local ranges is node {}", node_id);
                    }
                    Some(node_id) = d.controller_node_id.take() => {
                        coordinator.state.set_controller(node_id);
                    }
                    Some(table) = d.slots_allocation.take() => {
                        coordinator.apply_slots_allocation(table).await
                    }
                    Some(table) = d.slots_replica_allocation.take() => {
                        coordinator.apply_replica_allocation(table).await
                    }
                    Some(table) = d.replica_node_ids.take() => {
                        coordinator.apply_replica_node_ids(table).await
                    }
                }
            }
            tracing::debug!("Partition maintenance stopped");
        })
    }

    async fn apply_node_slots(&self, ranges: Vec<SlotRange>) {
        self.table.init_from_ranges(&ranges);
        let _ = self
            .fatal_on_error(self.store.persist(persist::NODE_SLOTS, &ranges).await);
    }

    async fn apply_node_slots_replicas(&self, ranges: Vec<SlotRange>) {
        self.table.init_replicas_from_ranges(&ranges);
        let _ = self.fatal_on_error(
            self.store
                .persist(persist::NODE_SLOTS_REPLICAS, &ranges)
                .await,
        );
    }

    async fn apply_promotion(&self, ranges: Vec<SlotRange>) {
        let promoted = self.table.promote(&ranges);
        info!(
            "Promoted {} of {} range(s) from replica to primary: {}",
            promoted.len(),
            ranges.len(),
            format_ranges(&ranges)
        );
        let _ = self.persist_local_slices().await;
    }

    async fn apply_replica_assignment(&self, ranges: Vec<SlotRange>) {
        self.table.add_replica_ranges(&ranges);
        info!("Now holding replicas {}", format_ranges(&ranges));
        let _ = self.persist_local_slices().await;
    }

    async fn apply_slots_allocation(&self, table: SlotAllocation) {
        self.state
            .update_plan(|plan| plan.slot_allocation = table.clone());
        let _ = self.fatal_on_error(
            self.store
                .persist(persist::SLOTS_ALLOCATION, &table)
                .await,
        );
    }

    async fn apply_replica_allocation(&self, table: ReplicaAllocation) {
        self.state
            .update_plan(|plan| plan.replica_allocation = table.clone());
        let _ = self.fatal_on_error(
            self.store
                .persist(persist::SLOTS_REPLICA_ALLOCATION, &table)
                .await,
        );
    }

    async fn apply_replica_node_ids(&self, table: ReplicaNodeIds) {
        self.state
            .update_plan(|plan| plan.replica_node_ids = table.clone());
        let _ = self.fatal_on_error(
            self.store
                .persist(persist::REPLICA_NODE_IDS, &table)
                .await,
        );
    }
}
