use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolError;

/// Cluster-wide node identifier, assigned by configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a peer announces about itself during the handshake.
///
/// The `client_port` is where the peer accepts client protocol connections;
/// it is handed out to clients through the server address listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub is_controller_candidate: bool,
    pub ip: String,
    pub client_port: u16,
}

impl NodeDescriptor {
    /// `"nodeId:ip:clientPort"`, the form clients receive in the address listing.
    pub fn server_address(&self) -> String {
        format!("{}:{}:{}", self.node_id, self.ip, self.client_port)
    }
}

/// A frame read off a peer link, tagged with the node it came from.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: NodeId,
    pub frame: crate::protocol::frame::PeerFrame,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Peer {addr} unreachable after {attempts} attempts: {source}")]
    Unreachable {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    #[error("Peer {0} is not connected")]
    NotConnected(NodeId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
