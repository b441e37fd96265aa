//! Slot-Partitioned Service Registry Cluster
//!
//! This library crate defines the modules of one registry server node. It serves as the
//! foundation for the `registry-node` binary (`main.rs`) and for the integration tests.
//!
//! ## Architecture Modules
//! - **`membership`**: persistent TCP links between nodes, the node handshake and the
//!   dispatcher that sorts inbound frames into typed queues.
//! - **`protocol`**: the binary peer frame and client request/response formats.
//! - **`election`**: quorum voting that picks the Controller among the candidates.
//! - **`partition`**: the slot planner, fail-over re-planning and the local table that
//!   routes service names to registry shards.
//! - **`registry`**: per-range instance storage, listeners and heartbeat expiry.
//! - **`replication`**: forwards client mutations to the replica holder and applies them there.
//! - **`failover`**: reacts to lost peers by re-electing or promoting replicas.
//! - **`client`**: the client-facing server and a small client connector.
//! - **`node`**: status, cluster state, boot sequence and the HTTP status port.
//! - **`persist`**: checksummed, fsynced table files.
//! - **`config`**: TOML node configuration.

pub mod client;
pub mod config;
pub mod election;
pub mod failover;
pub mod membership;
pub mod node;
pub mod partition;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod replication;
