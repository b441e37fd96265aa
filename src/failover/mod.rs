//! Failover Module
//!
//! Consumes disconnect notifications from the peer link layer.
//!
//! ## Core Concepts
//! - **Re-election**: losing the Controller makes the remaining candidates vote again.
//! - **Promotion**: the Controller moves a lost node's primary ranges to the node already
//!   holding their replicas, and picks new replica holders where the lost node was one.

pub mod service;
