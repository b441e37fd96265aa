use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::membership::types::NodeId;

/// Number of slots in the keyspace. Slots are numbered `1..=SLOT_COUNT`.
pub const SLOT_COUNT: u16 = 16384;

/// An inclusive run of slots. Serialized as `"start,end"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }

    pub fn slot_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.start, self.end)
    }
}

impl FromStr for SlotRange {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PartitionError::InvalidRange(s.to_string());

        let (start, end) = s.split_once(',').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;

        if start == 0 || start > end || end > SLOT_COUNT {
            return Err(invalid());
        }

        Ok(Self { start, end })
    }
}

impl Serialize for SlotRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Primary slot ranges per node. The union of all values covers `1..=SLOT_COUNT`
/// exactly once.
pub type SlotAllocation = BTreeMap<NodeId, Vec<SlotRange>>;

/// Ranges each node holds as a replica.
pub type ReplicaAllocation = BTreeMap<NodeId, Vec<SlotRange>>;

/// Primary node id -> node holding its replica.
pub type ReplicaNodeIds = BTreeMap<NodeId, NodeId>;

/// The three cluster-wide tables produced by the Controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub slot_allocation: SlotAllocation,
    pub replica_allocation: ReplicaAllocation,
    pub replica_node_ids: ReplicaNodeIds,
}

/// What changed when a lost node was removed from a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverChanges {
    pub lost: Option<NodeId>,
    /// Node that took over the lost node's primary ranges, and those ranges.
    pub promoted: Option<(NodeId, Vec<SlotRange>)>,
    /// Whether `promoted` came from an existing replica (false when the ranges had none).
    pub promoted_from_replica: bool,
    /// Replica holder -> ranges it must start holding.
    pub new_replicas: BTreeMap<NodeId, Vec<SlotRange>>,
    /// Primary -> its new replica holder.
    pub replica_node_id_changes: BTreeMap<NodeId, NodeId>,
    /// Primaries left without any replica holder.
    pub unreplicated: Vec<NodeId>,
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("Invalid slot range '{0}'")]
    InvalidRange(String),

    #[error("Cannot split {slots} slots across {nodes} nodes")]
    TooManyNodes { nodes: usize, slots: u16 },
}
