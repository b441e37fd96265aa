//! Peer Link Module
//!
//! Maintains the full mesh of TCP links between cluster nodes and demultiplexes the
//! frames arriving on them.
//!
//! ## Core Mechanisms
//! - **Handshake**: both ends exchange node id, candidate flag, ip and client port before
//!   any frame is sent. A malformed handshake is unrecoverable for the node.
//! - **Per-peer FIFO**: every link owns one outbound queue and one writer task.
//! - **Reconnect**: failed dials are retried a few times, then parked and retried
//!   periodically.
//! - **Dispatch**: inbound frames are routed by type tag into typed queues.

pub mod dispatcher;
pub mod handshake;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
