//! Controller Election Module
//!
//! Picks one Controller among the controller candidates.
//!
//! ## Core Concepts
//! - **Votes**: `[voter, controller, round]` triples exchanged between candidates.
//! - **Tally**: `RoundTally` counts one vote per voter and decides a round once complete.
//! - **Coordinator**: `ElectionCoordinator` drives rounds over any `VoteChannel`, with a
//!   per-round timeout so a lost vote cannot block the node forever.

pub mod coordinator;
pub mod tally;
pub mod types;
