//! Slot Partitioning Module
//!
//! Divides the 16384-slot keyspace among cluster nodes.
//!
//! ## Core Concepts
//! - **Slots**: every service name hashes to one slot; slots are grouped into contiguous
//!   `SlotRange`s, each owned by exactly one node as primary.
//! - **Planning**: the Controller computes the cluster-wide `PartitionPlan` (`planner`).
//! - **Local Table**: each node installs its own primary and replica ranges into a
//!   `PartitionTable`, which routes service names to registry shards.

pub mod planner;
pub mod table;
pub mod types;
