use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::membership::types::NodeId;

/// One candidate's vote in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_node_id: NodeId,
    pub controller_node_id: NodeId,
    pub round: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Elected; computes and distributes the partition plan.
    Controller,
    /// Took part in the election and keeps the full tables for take-over.
    Candidate,
    /// Never votes; receives only its own slice of the tables.
    Ordinary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub controller: NodeId,
    pub role: NodeRole,
    /// Round in which the decision was reached.
    pub round: u32,
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a round may wait for missing votes before re-broadcasting.
    pub round_timeout: Duration,
    /// Consecutive timed-out rounds after which the election gives up.
    pub max_stalled_rounds: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(10),
            max_stalled_rounds: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Election stalled in round {round} after {stalls} timeouts ({received}/{expected} votes)")]
    Stalled {
        round: u32,
        stalls: u32,
        received: usize,
        expected: usize,
    },

    #[error("Election aborted: node is shutting down")]
    Aborted,
}
