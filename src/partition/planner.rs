//! Partition Planner
//!
//! Computes the cluster-wide tables on the Controller.
//!
//! ## Responsibilities
//! - **Slot Allocation**: contiguous ranges of `SLOT_COUNT / n` slots per node, other nodes
//!   first in ascending id order, the Controller last absorbing the remainder so its
//!   range always ends at `SLOT_COUNT`.
//! - **Replica Assignment**: each primary gets one uniformly random holder other than itself,
//!   drawn from the nodes it keeps a direct link with. Ordinary nodes only dial the
//!   controller candidates, so an ordinary primary always replicates to a candidate.
//! - **Fail-over**: removes a lost node from a plan, moving its primaries to their replica
//!   holder and re-homing the replicas it was holding.

use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};

use super::types::{
    FailoverChanges, PartitionError, PartitionPlan, ReplicaAllocation, ReplicaNodeIds,
    SLOT_COUNT, SlotAllocation, SlotRange,
};
use crate::membership::types::NodeId;

pub fn allocate_slots(controller: NodeId, others: &[NodeId]) -> Result<SlotAllocation, PartitionError> {
    let mut others: Vec<NodeId> = others
        .iter()
        .copied()
        .filter(|id| *id != controller)
        .collect();
    others.sort();
    others.dedup();

    let n = others.len() as u32 + 1;
    let total = SLOT_COUNT as u32;
    if n > total {
        return Err(PartitionError::TooManyNodes {
            nodes: n as usize,
            slots: SLOT_COUNT,
        });
    }

    let base = total / n;
    let remainder = total - base * n;

    let mut allocation = SlotAllocation::new();
    let mut next_start = 1u32;

    for node_id in others {
        let end = next_start + base - 1;
        allocation.insert(node_id, vec![SlotRange::new(next_start as u16, end as u16)]);
        next_start = end + 1;
    }

    let end = next_start + base + remainder - 1;
    allocation.insert(controller, vec![SlotRange::new(next_start as u16, end as u16)]);

    Ok(allocation)
}

/// Nodes among `nodes` that share a link with `primary`.
///
/// Candidates link with every node; two ordinary nodes never link with each other.
pub fn linked_holders<I>(primary: NodeId, nodes: I, candidates: &BTreeSet<NodeId>) -> Vec<NodeId>
where
    I: IntoIterator<Item = NodeId>,
{
    let primary_is_candidate = candidates.contains(&primary);
    nodes
        .into_iter()
        .filter(|id| *id != primary && (primary_is_candidate || candidates.contains(id)))
        .collect()
}

pub fn assign_replicas<R: Rng + ?Sized>(
    allocation: &SlotAllocation,
    candidates: &BTreeSet<NodeId>,
    rng: &mut R,
) -> (ReplicaAllocation, ReplicaNodeIds) {
    let mut replica_allocation = ReplicaAllocation::new();
    let mut replica_node_ids = ReplicaNodeIds::new();

    for (primary, ranges) in allocation {
        let holders = linked_holders(*primary, allocation.keys().copied(), candidates);

        let Some(&holder) = holders.choose(rng) else {
            continue;
        };

        let held = replica_allocation.entry(holder).or_default();
        held.extend(ranges.iter().copied());
        held.sort();
        replica_node_ids.insert(*primary, holder);
    }

    (replica_allocation, replica_node_ids)
}

/// Full plan for `controller` and `others`. `candidates` lists the controller
/// candidates among them and decides which holders a primary can reach.
pub fn plan<R: Rng + ?Sized>(
    controller: NodeId,
    others: &[NodeId],
    candidates: &BTreeSet<NodeId>,
    rng: &mut R,
) -> Result<PartitionPlan, PartitionError> {
    let slot_allocation = allocate_slots(controller, others)?;
    let (replica_allocation, replica_node_ids) =
        assign_replicas(&slot_allocation, candidates, rng);

    Ok(PartitionPlan {
        slot_allocation,
        replica_allocation,
        replica_node_ids,
    })
}

impl PartitionPlan {
    pub fn node_slots(&self, node_id: NodeId) -> Vec<SlotRange> {
        self.slot_allocation.get(&node_id).cloned().unwrap_or_default()
    }

    pub fn node_replica_slots(&self, node_id: NodeId) -> Vec<SlotRange> {
        self.replica_allocation.get(&node_id).cloned().unwrap_or_default()
    }

    pub fn replica_of(&self, node_id: NodeId) -> Option<NodeId> {
        self.replica_node_ids.get(&node_id).copied()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.slot_allocation.keys().copied().collect()
    }

    /// Removes `lost` from the plan.
    ///
    /// Its primary ranges move to its replica holder (or to `fallback` when it had none)
    /// and inherit that node's own replica holder. Every primary whose replicas lived
    /// on `lost` gets a new random holder among the survivors it is linked with.
    pub fn fail_over<R: Rng + ?Sized>(
        &mut self,
        lost: NodeId,
        fallback: NodeId,
        candidates: &BTreeSet<NodeId>,
        rng: &mut R,
    ) -> FailoverChanges {
        let mut changes = FailoverChanges {
            lost: Some(lost),
            ..Default::default()
        };
        let mut new_replicas: BTreeMap<NodeId, Vec<SlotRange>> = BTreeMap::new();

        let lost_ranges = self.slot_allocation.remove(&lost).unwrap_or_default();
        let lost_holder = self.replica_node_ids.remove(&lost);
        self.replica_allocation.remove(&lost);

        if !lost_ranges.is_empty() {
            let (target, from_replica) = match lost_holder {
                Some(holder) if self.slot_allocation.contains_key(&holder) => (holder, true),
                _ => (fallback, false),
            };

            if from_replica && let Some(held) = self.replica_allocation.get_mut(&target) {
                held.retain(|range| !lost_ranges.contains(range));
                if held.is_empty() {
                    self.replica_allocation.remove(&target);
                }
            }

            let owned = self.slot_allocation.entry(target).or_default();
            owned.extend(lost_ranges.iter().copied());
            owned.sort();

            if let Some(&target_holder) = self.replica_node_ids.get(&target)
                && target_holder != lost
            {
                new_replicas
                    .entry(target_holder)
                    .or_default()
                    .extend(lost_ranges.iter().copied());
            }

            changes.promoted = Some((target, lost_ranges));
            changes.promoted_from_replica = from_replica;
        }

        let orphaned: Vec<NodeId> = self
            .replica_node_ids
            .iter()
            .filter(|(_, holder)| **holder == lost)
            .map(|(primary, _)| *primary)
            .collect();

        for primary in orphaned {
            self.replica_node_ids.remove(&primary);

            let survivors =
                linked_holders(primary, self.slot_allocation.keys().copied(), candidates);

            match survivors.choose(rng) {
                Some(&holder) => {
                    new_replicas
                        .entry(holder)
                        .or_default()
                        .extend(self.node_slots(primary));
                    self.replica_node_ids.insert(primary, holder);
                    changes.replica_node_id_changes.insert(primary, holder);
                }
                None => changes.unreplicated.push(primary),
            }
        }

        for (holder, ranges) in new_replicas.iter_mut() {
            ranges.sort();
            ranges.dedup();

            let held = self.replica_allocation.entry(*holder).or_default();
            held.extend(ranges.iter().copied());
            held.sort();
            held.dedup();
        }

        changes.new_replicas = new_replicas;
        changes
    }
}
