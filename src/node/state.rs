use parking_lot::RwLock;

use super::status::{NodeStatus, StatusHandle};
use crate::election::types::NodeRole;
use crate::membership::types::{NodeDescriptor, NodeId};
use crate::partition::types::PartitionPlan;

/// Cluster-level facts this node currently believes.
pub struct ClusterState {
    pub local: NodeDescriptor,
    pub status: StatusHandle,
    role: RwLock<NodeRole>,
    controller: RwLock<Option<NodeId>>,

    /// Full tables; present on the Controller and on candidates.
    plan: RwLock<Option<PartitionPlan>>,
}

impl ClusterState {
    pub fn new(local: NodeDescriptor, status: StatusHandle) -> Self {
        let role = if local.is_controller_candidate {
            NodeRole::Candidate
        } else {
            NodeRole::Ordinary
        };

        Self {
            local,
            status,
            role: RwLock::new(role),
            controller: RwLock::new(None),
            plan: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.write() = role;
    }

    pub fn is_controller(&self) -> bool {
        self.role() == NodeRole::Controller
    }

    pub fn controller(&self) -> Option<NodeId> {
        *self.controller.read()
    }

    pub fn set_controller(&self, controller: NodeId) {
        let previous = self.controller.write().replace(controller);
        if previous != Some(controller) {
            tracing::info!("Controller is now node {}", controller);
        }
    }

    pub fn plan(&self) -> Option<PartitionPlan> {
        self.plan.read().clone()
    }

    pub fn set_plan(&self, plan: PartitionPlan) {
        *self.plan.write() = Some(plan);
    }

    /// Applies `update` to the stored plan, creating an empty one first if needed.
    pub fn update_plan<F>(&self, update: F) -> PartitionPlan
    where
        F: FnOnce(&mut PartitionPlan),
    {
        let mut guard = self.plan.write();
        let plan = guard.get_or_insert_with(PartitionPlan::default);
        update(plan);
        plan.clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.status.get()
    }
}
