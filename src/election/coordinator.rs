//! Election Coordinator
//!
//! Round-based voting among controller candidates.
//!
//! ## Algorithm
//! - Round 1 starts with every candidate voting for itself.
//! - Each candidate broadcasts its vote and collects one vote per candidate for the round.
//! - Once every candidate has voted, a candidate holding `count / 2 + 1` votes is elected.
//! - Otherwise everyone votes for the largest id seen in the round and the next round starts,
//!   so all candidates converge on the largest id after at most one extra round.
//!
//! Votes for later rounds are buffered; votes for earlier rounds are dropped. Round
//! numbers keep increasing across re-elections, so votes left over from a previous
//! election are always stale.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::tally::{RoundResult, RoundTally};
use super::types::{ElectionConfig, ElectionError, ElectionOutcome, NodeRole, Vote};
use crate::membership::dispatcher::MessageDispatcher;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::node::status::StatusHandle;
use crate::protocol::frame::PeerMessage;

/// Transport used by an election to exchange votes.
pub trait VoteChannel: Send + Sync {
    fn broadcast_vote(&self, vote: &Vote);

    /// Next vote from any other candidate, or `None` if nothing arrived in time.
    fn next_vote(&self, timeout: Duration) -> impl Future<Output = Option<Vote>> + Send;
}

/// Votes carried over peer links and received through the dispatcher.
pub struct PeerVoteChannel {
    membership: Arc<MembershipService>,
    dispatcher: Arc<MessageDispatcher>,
    candidates: Vec<NodeId>,
}

impl PeerVoteChannel {
    pub fn new(
        membership: Arc<MembershipService>,
        dispatcher: Arc<MessageDispatcher>,
        candidates: Vec<NodeId>,
    ) -> Self {
        Self {
            membership,
            dispatcher,
            candidates,
        }
    }
}

impl VoteChannel for PeerVoteChannel {
    fn broadcast_vote(&self, vote: &Vote) {
        self.membership
            .broadcast(self.candidates.iter().copied(), &PeerMessage::Vote(*vote));
    }

    fn next_vote(&self, timeout: Duration) -> impl Future<Output = Option<Vote>> + Send {
        self.dispatcher.votes.take_timeout(timeout)
    }
}

enum RoundEnd {
    Decided(RoundResult),
    Stalled(RoundTally),
}

pub struct ElectionCoordinator {
    self_id: NodeId,
    config: ElectionConfig,
    last_round: AtomicU32,
    status: StatusHandle,
}

impl ElectionCoordinator {
    pub fn new(self_id: NodeId, config: ElectionConfig, status: StatusHandle) -> Self {
        Self {
            self_id,
            config,
            last_round: AtomicU32::new(0),
            status,
        }
    }

    /// Round in which the last completed election was decided.
    pub fn last_round(&self) -> u32 {
        self.last_round.load(Ordering::Acquire)
    }

    /// Runs an election among `candidate_count` candidates, this node included.
    pub async fn elect<C: VoteChannel>(
        &self,
        channel: &C,
        candidate_count: usize,
    ) -> Result<ElectionOutcome, ElectionError> {
        let candidate_count = candidate_count.max(1);
        let mut round = self.last_round() + 1;
        let mut vote_for = self.self_id;
        let mut stalls = 0u32;
        let mut early_votes: Vec<Vote> = Vec::new();

        info!(
            "Starting controller election among {} candidate(s) at round {}",
            candidate_count, round
        );

        loop {
            let own_vote = Vote {
                voter_node_id: self.self_id,
                controller_node_id: vote_for,
                round,
            };

            let mut tally = RoundTally::new(round, candidate_count);
            tally.record(own_vote);
            early_votes.retain(|vote| {
                if vote.round == round {
                    tally.record(*vote);
                    false
                } else {
                    vote.round > round
                }
            });

            tracing::debug!("Round {}: voting for node {}", round, vote_for);
            channel.broadcast_vote(&own_vote);

            let result = loop {
                match self
                    .collect_round(channel, &mut tally, &mut early_votes)
                    .await?
                {
                    RoundEnd::Decided(result) => break result,
                    RoundEnd::Stalled(tally) => {
                        stalls += 1;
                        if stalls >= self.config.max_stalled_rounds {
                            return Err(ElectionError::Stalled {
                                round,
                                stalls,
                                received: tally.received(),
                                expected: candidate_count,
                            });
                        }
                        tracing::warn!(
                            "Round {} timed out with {}/{} votes, re-broadcasting ({}/{})",
                            round,
                            tally.received(),
                            candidate_count,
                            stalls,
                            self.config.max_stalled_rounds
                        );
                        channel.broadcast_vote(&own_vote);
                    }
                }
            };
            stalls = 0;

            match result {
                RoundResult::Elected(controller) => {
                    self.last_round.store(round, Ordering::Release);
                    let role = if controller == self.self_id {
                        NodeRole::Controller
                    } else {
                        NodeRole::Candidate
                    };
                    info!(
                        "Election decided in round {}: node {} is controller (local role {:?})",
                        round, controller, role
                    );
                    return Ok(ElectionOutcome {
                        controller,
                        role,
                        round,
                    });
                }
                RoundResult::Undecided { next_vote } => {
                    info!(
                        "Round {} undecided, voting for node {} next",
                        round, next_vote
                    );
                    vote_for = next_vote;
                    round += 1;
                }
                RoundResult::Pending => unreachable!("collect_round returns only complete rounds"),
            }
        }
    }

    async fn collect_round<C: VoteChannel>(
        &self,
        channel: &C,
        tally: &mut RoundTally,
        early_votes: &mut Vec<Vote>,
    ) -> Result<RoundEnd, ElectionError> {
        let deadline = Instant::now() + self.config.round_timeout;

        loop {
            let result = tally.result();
            if result != RoundResult::Pending {
                return Ok(RoundEnd::Decided(result));
            }
            if !self.status.is_active() {
                return Err(ElectionError::Aborted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RoundEnd::Stalled(tally.clone()));
            }

            match channel.next_vote(remaining).await {
                Some(vote) if vote.round == tally.round() => {
                    tally.record(vote);
                }
                Some(vote) if vote.round > tally.round() => early_votes.push(vote),
                Some(vote) => tracing::debug!("Discarding stale vote {:?}", vote),
                None => {}
            }
        }
    }
}
