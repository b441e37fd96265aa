//! Inter-node Frames
//!
//! Every peer message is `[4B type][payload]`. On the socket each frame is
//! preceded by a 4-byte length covering type and payload.
//!
//! Table payloads (slot allocation, replica allocation, replica node ids, range lists)
//! are UTF-8 JSON with slot ranges written as `"start,end"`. Single node ids are
//! plain 4-byte integers. Replica forwarding frames embed a complete client
//! request frame unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::client::ClientMessage;
use super::codec::get_i32;
use super::{MAX_FRAME_LEN, ProtocolError};
use crate::election::types::Vote;
use crate::membership::types::NodeId;
use crate::partition::types::{ReplicaAllocation, ReplicaNodeIds, SlotAllocation, SlotRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Vote = 1,
    SlotsAllocation = 2,
    NodeSlots = 3,
    SlotsReplicaAllocation = 4,
    NodeSlotsReplicas = 5,
    ReplicaNodeId = 6,
    ReplicaRegister = 7,
    ReplicaHeartbeat = 8,
    ReplicaNodeIds = 9,
    ControllerNodeId = 10,
    PromoteReplicas = 11,
    AssignReplicas = 12,
    Terminate = -1,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        let message_type = match value {
            1 => MessageType::Vote,
            2 => MessageType::SlotsAllocation,
            3 => MessageType::NodeSlots,
            4 => MessageType::SlotsReplicaAllocation,
            5 => MessageType::NodeSlotsReplicas,
            6 => MessageType::ReplicaNodeId,
            7 => MessageType::ReplicaRegister,
            8 => MessageType::ReplicaHeartbeat,
            9 => MessageType::ReplicaNodeIds,
            10 => MessageType::ControllerNodeId,
            11 => MessageType::PromoteReplicas,
            12 => MessageType::AssignReplicas,
            -1 => MessageType::Terminate,
            _ => return None,
        };
        Some(message_type)
    }
}

/// A raw frame: the type tag is readable without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub message_type: i32,
    pub payload: Bytes,
}

impl PeerFrame {
    pub fn terminate() -> Self {
        Self {
            message_type: MessageType::Terminate as i32,
            payload: Bytes::new(),
        }
    }

    pub fn is_terminate(&self) -> bool {
        self.message_type == MessageType::Terminate as i32
    }
}

/// Decoded inter-node message.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Vote(Vote),
    SlotsAllocation(SlotAllocation),
    NodeSlots(Vec<SlotRange>),
    SlotsReplicaAllocation(ReplicaAllocation),
    NodeSlotsReplicas(Vec<SlotRange>),
    ReplicaNodeId(NodeId),
    ReplicaRegister(ClientMessage),
    ReplicaHeartbeat(ClientMessage),
    ReplicaNodeIds(ReplicaNodeIds),
    ControllerNodeId(NodeId),
    PromoteReplicas(Vec<SlotRange>),
    AssignReplicas(Vec<SlotRange>),
    Terminate,
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::Vote(_) => MessageType::Vote,
            PeerMessage::SlotsAllocation(_) => MessageType::SlotsAllocation,
            PeerMessage::NodeSlots(_) => MessageType::NodeSlots,
            PeerMessage::SlotsReplicaAllocation(_) => MessageType::SlotsReplicaAllocation,
            PeerMessage::NodeSlotsReplicas(_) => MessageType::NodeSlotsReplicas,
            PeerMessage::ReplicaNodeId(_) => MessageType::ReplicaNodeId,
            PeerMessage::ReplicaRegister(_) => MessageType::ReplicaRegister,
            PeerMessage::ReplicaHeartbeat(_) => MessageType::ReplicaHeartbeat,
            PeerMessage::ReplicaNodeIds(_) => MessageType::ReplicaNodeIds,
            PeerMessage::ControllerNodeId(_) => MessageType::ControllerNodeId,
            PeerMessage::PromoteReplicas(_) => MessageType::PromoteReplicas,
            PeerMessage::AssignReplicas(_) => MessageType::AssignReplicas,
            PeerMessage::Terminate => MessageType::Terminate,
        }
    }

    pub fn encode(&self) -> Result<PeerFrame, ProtocolError> {
        let mut payload = BytesMut::new();

        match self {
            PeerMessage::Vote(vote) => {
                payload.put_i32(vote.voter_node_id.0);
                payload.put_i32(vote.controller_node_id.0);
                payload.put_i32(vote.round as i32);
            }
            PeerMessage::SlotsAllocation(table) | PeerMessage::SlotsReplicaAllocation(table) => {
                payload.put_slice(&serde_json::to_vec(table)?);
            }
            PeerMessage::ReplicaNodeIds(table) => {
                payload.put_slice(&serde_json::to_vec(table)?);
            }
            PeerMessage::NodeSlots(ranges)
            | PeerMessage::NodeSlotsReplicas(ranges)
            | PeerMessage::PromoteReplicas(ranges)
            | PeerMessage::AssignReplicas(ranges) => {
                payload.put_slice(&serde_json::to_vec(ranges)?);
            }
            PeerMessage::ReplicaNodeId(node_id) | PeerMessage::ControllerNodeId(node_id) => {
                payload.put_i32(node_id.0);
            }
            PeerMessage::ReplicaRegister(request) | PeerMessage::ReplicaHeartbeat(request) => {
                payload.put_slice(&request.encode()?);
            }
            PeerMessage::Terminate => {}
        }

        Ok(PeerFrame {
            message_type: self.message_type() as i32,
            payload: payload.freeze(),
        })
    }

    pub fn decode(frame: &PeerFrame) -> Result<Self, ProtocolError> {
        let message_type = MessageType::from_i32(frame.message_type)
            .ok_or(ProtocolError::UnknownMessageType(frame.message_type))?;
        let mut payload = frame.payload.clone();

        let message = match message_type {
            MessageType::Vote => {
                let voter = get_i32(&mut payload)?;
                let controller = get_i32(&mut payload)?;
                let round = get_i32(&mut payload)?;
                if round < 1 {
                    return Err(ProtocolError::InvalidField {
                        field: "round",
                        reason: format!("round {} is not positive", round),
                    });
                }
                PeerMessage::Vote(Vote {
                    voter_node_id: NodeId(voter),
                    controller_node_id: NodeId(controller),
                    round: round as u32,
                })
            }
            MessageType::SlotsAllocation => {
                PeerMessage::SlotsAllocation(serde_json::from_slice(&payload)?)
            }
            MessageType::SlotsReplicaAllocation => {
                PeerMessage::SlotsReplicaAllocation(serde_json::from_slice(&payload)?)
            }
            MessageType::ReplicaNodeIds => {
                PeerMessage::ReplicaNodeIds(serde_json::from_slice(&payload)?)
            }
            MessageType::NodeSlots => PeerMessage::NodeSlots(serde_json::from_slice(&payload)?),
            MessageType::NodeSlotsReplicas => {
                PeerMessage::NodeSlotsReplicas(serde_json::from_slice(&payload)?)
            }
            MessageType::PromoteReplicas => {
                PeerMessage::PromoteReplicas(serde_json::from_slice(&payload)?)
            }
            MessageType::AssignReplicas => {
                PeerMessage::AssignReplicas(serde_json::from_slice(&payload)?)
            }
            MessageType::ReplicaNodeId => PeerMessage::ReplicaNodeId(NodeId(get_i32(&mut payload)?)),
            MessageType::ControllerNodeId => {
                PeerMessage::ControllerNodeId(NodeId(get_i32(&mut payload)?))
            }
            MessageType::ReplicaRegister => {
                PeerMessage::ReplicaRegister(ClientMessage::decode(payload)?)
            }
            MessageType::ReplicaHeartbeat => {
                PeerMessage::ReplicaHeartbeat(ClientMessage::decode(payload)?)
            }
            MessageType::Terminate => PeerMessage::Terminate,
        };

        Ok(message)
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &PeerFrame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 + frame.payload.len());
    buf.put_i32((4 + frame.payload.len()) as i32);
    buf.put_i32(frame.message_type);
    buf.put_slice(&frame.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<PeerFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    if len < 4 || len as usize > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(len as i64));
    }

    let message_type = reader.read_i32().await?;
    let mut payload = vec![0u8; len as usize - 4];
    reader.read_exact(&mut payload).await?;

    Ok(PeerFrame {
        message_type,
        payload: Bytes::from(payload),
    })
}
