//! Link handshake.
//!
//! Both sides exchange `[4B nodeId][4B isCandidate 0/1][4B ipLen][ip bytes][4B clientPort]`.
//! The dialing side writes first and then reads; the accepting side reads first.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{LinkError, NodeDescriptor, NodeId};
use crate::protocol::ProtocolError;

const MAX_IP_LEN: i32 = 256;

pub fn encode_descriptor(descriptor: &NodeDescriptor) -> Bytes {
    let ip = descriptor.ip.as_bytes();
    let mut buf = BytesMut::with_capacity(16 + ip.len());
    buf.put_i32(descriptor.node_id.0);
    buf.put_i32(descriptor.is_controller_candidate as i32);
    buf.put_i32(ip.len() as i32);
    buf.put_slice(ip);
    buf.put_i32(descriptor.client_port as i32);
    buf.freeze()
}

pub async fn read_descriptor<R>(reader: &mut R) -> Result<NodeDescriptor, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let node_id = reader.read_i32().await?;

    let is_candidate = match reader.read_i32().await? {
        0 => false,
        1 => true,
        other => {
            return Err(ProtocolError::InvalidField {
                field: "isCandidate",
                reason: format!("expected 0 or 1, got {}", other),
            });
        }
    };

    let ip_len = reader.read_i32().await?;
    if !(0..=MAX_IP_LEN).contains(&ip_len) {
        return Err(ProtocolError::InvalidLength(ip_len as i64));
    }
    let mut ip = vec![0u8; ip_len as usize];
    reader.read_exact(&mut ip).await?;
    let ip = String::from_utf8(ip)?;

    let client_port = reader.read_i32().await?;
    let client_port = u16::try_from(client_port).map_err(|_| ProtocolError::InvalidField {
        field: "clientPort",
        reason: format!("{} is not a valid port", client_port),
    })?;

    Ok(NodeDescriptor {
        node_id: NodeId(node_id),
        is_controller_candidate: is_candidate,
        ip,
        client_port,
    })
}

async fn write_descriptor<W>(writer: &mut W, descriptor: &NodeDescriptor) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_descriptor(descriptor)).await?;
    writer.flush().await?;
    Ok(())
}

/// Dialing side: announce ourselves, then learn who answered.
pub async fn dial<S>(
    stream: &mut S,
    local: &NodeDescriptor,
    timeout: Duration,
    addr: &str,
) -> Result<NodeDescriptor, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        write_descriptor(stream, local).await?;
        read_descriptor(stream).await
    };

    finish(tokio::time::timeout(timeout, exchange).await, timeout, addr)
}

/// Accepting side: learn who dialed, then announce ourselves.
pub async fn accept<S>(
    stream: &mut S,
    local: &NodeDescriptor,
    timeout: Duration,
    addr: &str,
) -> Result<NodeDescriptor, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let remote = read_descriptor(stream).await?;
        write_descriptor(stream, local).await?;
        Ok::<_, ProtocolError>(remote)
    };

    finish(tokio::time::timeout(timeout, exchange).await, timeout, addr)
}

fn finish(
    outcome: Result<Result<NodeDescriptor, ProtocolError>, tokio::time::error::Elapsed>,
    timeout: Duration,
    addr: &str,
) -> Result<NodeDescriptor, LinkError> {
    match outcome {
        Ok(Ok(remote)) => Ok(remote),
        Ok(Err(e)) => Err(LinkError::Handshake {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(LinkError::Handshake {
            addr: addr.to_string(),
            reason: format!("no answer within {:?}", timeout),
        }),
    }
}
