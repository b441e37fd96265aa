//! Wire Protocols
//!
//! Defines the byte layouts spoken on the two TCP ports a node exposes.
//!
//! ## Core Concepts
//! - **Peer frames** (`frame`): inter-node messages, each tagged with a 4-byte message type
//!   and carried behind a 4-byte length prefix on the socket.
//! - **Client messages** (`client`): request/response frames exchanged with registry clients,
//!   correlated by a 16-byte request id.
//! - **Field codec** (`codec`): big-endian integers, length-prefixed strings and JSON blobs
//!   shared by both layouts.

pub mod client;
pub mod codec;
pub mod frame;


/// Upper bound for any single frame body accepted from the network.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown peer message type {0}")]
    UnknownMessageType(i32),

    #[error("Unknown client request type {0}")]
    UnknownRequestType(i32),

    #[error("Invalid frame flag {0}")]
    InvalidFlag(i32),

    #[error("Invalid length {0}")]
    InvalidLength(i64),

    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UTF-8 string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the remote side closed the stream between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
