use std::collections::BTreeMap;

use super::types::Vote;
use crate::membership::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    /// Not every candidate has voted yet.
    Pending,
    /// Some candidate holds a quorum of the complete round.
    Elected(NodeId),
    /// Every candidate voted but nobody reached quorum; vote for `next_vote` next round.
    Undecided { next_vote: NodeId },
}

/// Votes received for one round, at most one per voter.
#[derive(Debug, Clone)]
pub struct RoundTally {
    round: u32,
    candidate_count: usize,
    votes: BTreeMap<NodeId, NodeId>,
}

impl RoundTally {
    pub fn new(round: u32, candidate_count: usize) -> Self {
        Self {
            round,
            candidate_count,
            votes: BTreeMap::new(),
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn quorum(&self) -> usize {
        self.candidate_count / 2 + 1
    }

    /// Records a vote of this round. A repeated vote from the same voter replaces
    /// the earlier one. Votes of other rounds are ignored and `false` is returned.
    pub fn record(&mut self, vote: Vote) -> bool {
        if vote.round != self.round {
            return false;
        }
        self.votes.insert(vote.voter_node_id, vote.controller_node_id);
        true
    }

    pub fn received(&self) -> usize {
        self.votes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.votes.len() >= self.candidate_count
    }

    /// Candidate holding at least a quorum of the votes received so far.
    pub fn leader(&self) -> Option<NodeId> {
        if self.votes.len() < self.quorum() {
            return None;
        }

        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for controller in self.votes.values() {
            *counts.entry(*controller).or_default() += 1;
        }

        counts
            .into_iter()
            .find(|(_, count)| *count >= self.quorum())
            .map(|(controller, _)| controller)
    }

    pub fn result(&self) -> RoundResult {
        if !self.is_complete() {
            return RoundResult::Pending;
        }

        match self.leader() {
            Some(controller) => RoundResult::Elected(controller),
            None => RoundResult::Undecided {
                next_vote: self
                    .votes
                    .values()
                    .copied()
                    .max()
                    .unwrap_or(NodeId(i32::MIN)),
            },
        }
    }
}
