//! Node Module
//!
//! Assembles one registry server node from the other subsystems and drives its boot.
//!
//! ## Core Concepts
//! - **Status**: a process-wide `NodeStatus` every long-running loop observes. `Fatal` and
//!   `ShuttingDown` stop the node for good.
//! - **State**: role, known Controller and (on candidates) the full partition plan.
//! - **Boot**: link peers, elect a Controller among candidates, allocate or receive slots,
//!   then start expiry, replication, fail-over and the client server.
//! - **HTTP**: optional read-only status endpoints.

pub mod context;
pub mod controller;
pub mod http;
pub mod state;
pub mod status;

#[cfg(test)]
mod tests;
