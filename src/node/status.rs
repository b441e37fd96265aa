use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Initializing,
    Running,
    ShuttingDown,
    Fatal,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::ShuttingDown | NodeStatus::Fatal)
    }
}

/// Process-wide lifecycle flag shared by every long-running loop.
///
/// `Fatal` and `ShuttingDown` are terminal: once entered, the status never moves back.
#[derive(Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<NodeStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(NodeStatus::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> NodeStatus {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        !self.get().is_terminal()
    }

    pub fn set_running(&self) -> bool {
        self.tx.send_if_modified(|status| {
            if *status == NodeStatus::Initializing {
                *status = NodeStatus::Running;
                true
            } else {
                false
            }
        })
    }

    pub fn fatal(&self, reason: &str) {
        tracing::error!("Node entering FATAL state: {}", reason);
        self.tx.send_if_modified(|status| {
            if *status == NodeStatus::Fatal {
                false
            } else {
                *status = NodeStatus::Fatal;
                true
            }
        });
    }

    pub fn shutdown(&self) {
        self.tx.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = NodeStatus::ShuttingDown;
                true
            }
        });
    }

    /// Resolves once the node is shutting down or has failed.
    pub async fn terminated(&self) -> NodeStatus {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => NodeStatus::ShuttingDown,
        }
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
