use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::election::coordinator::{ElectionCoordinator, PeerVoteChannel};
use crate::election::types::{ElectionError, NodeRole};
use crate::membership::dispatcher::MessageDispatcher;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::node::controller::PartitionCoordinator;
use crate::node::state::ClusterState;

/// What the trigger did about one lost peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// This node is the Controller and reassigned the lost node's ranges.
    Reassigned,
    /// The Controller was lost and an election among the remaining candidates ran.
    Reelected { controller: NodeId },
    /// Nothing for this node to do.
    Ignored,
    /// Re-election could not complete.
    Failed,
}

/// Reacts to lost peer links.
///
/// A candidate that loses the Controller starts a new election among the candidates
/// still linked; the winner takes over and fails over the previous Controller. A
/// Controller that loses any other node promotes that node's replica holder.
pub struct FailoverService {
    state: Arc<ClusterState>,
    membership: Arc<MembershipService>,
    dispatcher: Arc<MessageDispatcher>,
    election: Arc<ElectionCoordinator>,
    coordinator: Arc<PartitionCoordinator>,
}

impl FailoverService {
    pub fn new(
        state: Arc<ClusterState>,
        membership: Arc<MembershipService>,
        dispatcher: Arc<MessageDispatcher>,
        election: Arc<ElectionCoordinator>,
        coordinator: Arc<PartitionCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            membership,
            dispatcher,
            election,
            coordinator,
        })
    }

    pub fn start(
        self: Arc<Self>,
        mut disconnects: mpsc::UnboundedReceiver<NodeId>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let lost = tokio::select! {
                    lost = disconnects.recv() => lost,
                    _ = self.state.status.terminated() => break,
                };

                match lost {
                    Some(node_id) => {
                        self.handle_disconnect(node_id).await;
                    }
                    None => break,
                }
            }
            tracing::debug!("Failover trigger stopped");
        })
    }

    pub async fn handle_disconnect(&self, lost: NodeId) -> FailoverAction {
        let controller = self.state.controller();

        match self.state.role() {
            NodeRole::Controller => {
                info!("Node {} lost, reassigning its slots", lost);
                match self.coordinator.fail_over(lost).await {
                    Some(_) => FailoverAction::Reassigned,
                    None => FailoverAction::Ignored,
                }
            }
            NodeRole::Candidate if controller == Some(lost) => self.reelect(lost).await,
            _ => {
                tracing::debug!(
                    "Node {} lost; controller {:?} handles reassignment",
                    lost,
                    controller
                );
                FailoverAction::Ignored
            }
        }
    }

    async fn reelect(&self, previous: NodeId) -> FailoverAction {
        let candidates = self.membership.connected_candidates();
        tracing::warn!(
            "Controller node {} lost, re-electing among {} candidate(s)",
            previous,
            candidates.len() + 1
        );

        let channel = PeerVoteChannel::new(
            self.membership.clone(),
            self.dispatcher.clone(),
            candidates.clone(),
        );

        match self.election.elect(&channel, candidates.len() + 1).await {
            Ok(outcome) => {
                self.state.set_role(outcome.role);
                self.state.set_controller(outcome.controller);

                if outcome.role == NodeRole::Controller {
                    self.coordinator.take_over(previous).await;
                }

                FailoverAction::Reelected {
                    controller: outcome.controller,
                }
            }
            Err(ElectionError::Aborted) => FailoverAction::Failed,
            Err(e) => {
                self.state.status.fatal(&e.to_string());
                FailoverAction::Failed
            }
        }
    }
}
