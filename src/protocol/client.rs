//! Client Protocol
//!
//! Frame layout: `[4B flag][4B bodyLength][4B type][16B request id][fields]`, where
//! `bodyLength` counts every byte after itself. The flag tells requests from
//! responses; both directions use the same layout, since the server pushes
//! `ServiceChanged` requests to subscribed clients and expects a response back.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{get_i32, get_json, get_port, get_string, put_json, put_string};
use super::{MAX_FRAME_LEN, ProtocolError};
use crate::membership::types::NodeId;
use crate::partition::types::SlotAllocation;

pub const FLAG_REQUEST: i32 = 1;
pub const FLAG_RESPONSE: i32 = 2;
pub const REQUEST_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RequestType {
    FetchSlotsAllocation = 1,
    FetchServerAddresses = 2,
    Register = 3,
    Heartbeat = 4,
    FetchServerNodeId = 5,
    Subscribe = 6,
    ServiceChanged = 7,
}

impl RequestType {
    pub fn from_i32(value: i32) -> Option<Self> {
        let request_type = match value {
            1 => RequestType::FetchSlotsAllocation,
            2 => RequestType::FetchServerAddresses,
            3 => RequestType::Register,
            4 => RequestType::Heartbeat,
            5 => RequestType::FetchServerNodeId,
            6 => RequestType::Subscribe,
            7 => RequestType::ServiceChanged,
            _ => return None,
        };
        Some(request_type)
    }
}

/// 16 ASCII characters identifying one request/response exchange.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn new() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let mut id = [0u8; REQUEST_ID_LEN];
        id.copy_from_slice(&simple.as_bytes()[..REQUEST_ID_LEN]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestResult {
    Success = 1,
    Failure = 2,
    NotRegistered = 3,
}

impl RequestResult {
    pub fn from_i32(value: i32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(RequestResult::Success),
            2 => Ok(RequestResult::Failure),
            3 => Ok(RequestResult::NotRegistered),
            other => Err(ProtocolError::InvalidField {
                field: "result",
                reason: format!("unknown result code {}", other),
            }),
        }
    }
}

/// Identity of a service instance as sent by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAddress {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    FetchSlotsAllocation,
    FetchServerAddresses,
    Register(InstanceAddress),
    Heartbeat(InstanceAddress),
    FetchServerNodeId,
    Subscribe { service_name: String },
    ServiceChanged {
        service_name: String,
        addresses: Vec<String>,
    },
}

impl ClientRequest {
    pub fn request_type(&self) -> RequestType {
        match self {
            ClientRequest::FetchSlotsAllocation => RequestType::FetchSlotsAllocation,
            ClientRequest::FetchServerAddresses => RequestType::FetchServerAddresses,
            ClientRequest::Register(_) => RequestType::Register,
            ClientRequest::Heartbeat(_) => RequestType::Heartbeat,
            ClientRequest::FetchServerNodeId => RequestType::FetchServerNodeId,
            ClientRequest::Subscribe { .. } => RequestType::Subscribe,
            ClientRequest::ServiceChanged { .. } => RequestType::ServiceChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    SlotsAllocation(SlotAllocation),
    ServerAddresses(Vec<String>),
    Register(RequestResult),
    Heartbeat(RequestResult),
    ServerNodeId(NodeId),
    Subscribe(Vec<String>),
    ServiceChanged,
}

impl ClientResponse {
    pub fn request_type(&self) -> RequestType {
        match self {
            ClientResponse::SlotsAllocation(_) => RequestType::FetchSlotsAllocation,
            ClientResponse::ServerAddresses(_) => RequestType::FetchServerAddresses,
            ClientResponse::Register(_) => RequestType::Register,
            ClientResponse::Heartbeat(_) => RequestType::Heartbeat,
            ClientResponse::ServerNodeId(_) => RequestType::FetchServerNodeId,
            ClientResponse::Subscribe(_) => RequestType::Subscribe,
            ClientResponse::ServiceChanged => RequestType::ServiceChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPayload {
    Request(ClientRequest),
    Response(ClientResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub id: RequestId,
    pub payload: ClientPayload,
}

impl ClientMessage {
    pub fn request(request: ClientRequest) -> Self {
        Self {
            id: RequestId::new(),
            payload: ClientPayload::Request(request),
        }
    }

    pub fn response(id: RequestId, response: ClientResponse) -> Self {
        Self {
            id,
            payload: ClientPayload::Response(response),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut body = BytesMut::new();

        let flag = match &self.payload {
            ClientPayload::Request(request) => {
                body.put_i32(request.request_type() as i32);
                body.put_slice(self.id.as_bytes());
                encode_request_fields(&mut body, request)?;
                FLAG_REQUEST
            }
            ClientPayload::Response(response) => {
                body.put_i32(response.request_type() as i32);
                body.put_slice(self.id.as_bytes());
                encode_response_fields(&mut body, response)?;
                FLAG_RESPONSE
            }
        };

        let mut frame = BytesMut::with_capacity(8 + body.len());
        frame.put_i32(flag);
        frame.put_i32(body.len() as i32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decodes a complete frame, flag and length included.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        let flag = get_i32(&mut frame)?;
        let body_len = get_i32(&mut frame)?;
        if body_len < 0 || body_len as usize != frame.len() {
            return Err(ProtocolError::InvalidLength(body_len as i64));
        }
        Self::decode_body(flag, frame)
    }

    fn decode_body(flag: i32, mut body: Bytes) -> Result<Self, ProtocolError> {
        let raw_type = get_i32(&mut body)?;
        let request_type =
            RequestType::from_i32(raw_type).ok_or(ProtocolError::UnknownRequestType(raw_type))?;

        if body.len() < REQUEST_ID_LEN {
            return Err(ProtocolError::Truncated {
                needed: REQUEST_ID_LEN,
                available: body.len(),
            });
        }
        let mut id = [0u8; REQUEST_ID_LEN];
        id.copy_from_slice(&body.split_to(REQUEST_ID_LEN));
        let id = RequestId::from_bytes(id);

        let payload = match flag {
            FLAG_REQUEST => ClientPayload::Request(decode_request_fields(request_type, &mut body)?),
            FLAG_RESPONSE => {
                ClientPayload::Response(decode_response_fields(request_type, &mut body)?)
            }
            other => return Err(ProtocolError::InvalidFlag(other)),
        };

        Ok(Self { id, payload })
    }
}

fn encode_instance(buf: &mut BytesMut, instance: &InstanceAddress) {
    put_string(buf, &instance.service_name);
    put_string(buf, &instance.ip);
    buf.put_i32(instance.port as i32);
}

fn decode_instance(buf: &mut Bytes) -> Result<InstanceAddress, ProtocolError> {
    Ok(InstanceAddress {
        service_name: get_string(buf)?,
        ip: get_string(buf)?,
        port: get_port(buf)?,
    })
}

fn encode_request_fields(buf: &mut BytesMut, request: &ClientRequest) -> Result<(), ProtocolError> {
    match request {
        ClientRequest::FetchSlotsAllocation
        | ClientRequest::FetchServerAddresses
        | ClientRequest::FetchServerNodeId => {}
        ClientRequest::Register(instance) | ClientRequest::Heartbeat(instance) => {
            encode_instance(buf, instance);
        }
        ClientRequest::Subscribe { service_name } => put_string(buf, service_name),
        ClientRequest::ServiceChanged {
            service_name,
            addresses,
        } => {
            put_string(buf, service_name);
            put_json(buf, addresses)?;
        }
    }
    Ok(())
}

fn decode_request_fields(
    request_type: RequestType,
    buf: &mut Bytes,
) -> Result<ClientRequest, ProtocolError> {
    let request = match request_type {
        RequestType::FetchSlotsAllocation => ClientRequest::FetchSlotsAllocation,
        RequestType::FetchServerAddresses => ClientRequest::FetchServerAddresses,
        RequestType::FetchServerNodeId => ClientRequest::FetchServerNodeId,
        RequestType::Register => ClientRequest::Register(decode_instance(buf)?),
        RequestType::Heartbeat => ClientRequest::Heartbeat(decode_instance(buf)?),
        RequestType::Subscribe => ClientRequest::Subscribe {
            service_name: get_string(buf)?,
        },
        RequestType::ServiceChanged => ClientRequest::ServiceChanged {
            service_name: get_string(buf)?,
            addresses: get_json(buf)?,
        },
    };
    Ok(request)
}

fn encode_response_fields(
    buf: &mut BytesMut,
    response: &ClientResponse,
) -> Result<(), ProtocolError> {
    match response {
        ClientResponse::SlotsAllocation(table) => put_json(buf, table)?,
        ClientResponse::ServerAddresses(addresses) | ClientResponse::Subscribe(addresses) => {
            put_json(buf, addresses)?
        }
        ClientResponse::Register(result) | ClientResponse::Heartbeat(result) => {
            buf.put_i32(*result as i32)
        }
        ClientResponse::ServerNodeId(node_id) => buf.put_i32(node_id.0),
        ClientResponse::ServiceChanged => {}
    }
    Ok(())
}

fn decode_response_fields(
    request_type: RequestType,
    buf: &mut Bytes,
) -> Result<ClientResponse, ProtocolError> {
    let response = match request_type {
        RequestType::FetchSlotsAllocation => ClientResponse::SlotsAllocation(get_json(buf)?),
        RequestType::FetchServerAddresses => ClientResponse::ServerAddresses(get_json(buf)?),
        RequestType::Register => ClientResponse::Register(RequestResult::from_i32(get_i32(buf)?)?),
        RequestType::Heartbeat => {
            ClientResponse::Heartbeat(RequestResult::from_i32(get_i32(buf)?)?)
        }
        RequestType::FetchServerNodeId => ClientResponse::ServerNodeId(NodeId(get_i32(buf)?)),
        RequestType::Subscribe => ClientResponse::Subscribe(get_json(buf)?),
        RequestType::ServiceChanged => ClientResponse::ServiceChanged,
    };
    Ok(response)
}

pub async fn read_client_message<R>(reader: &mut R) -> Result<ClientMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let flag = reader.read_i32().await?;
    let body_len = reader.read_i32().await?;
    if body_len < 0 || body_len as usize > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(body_len as i64));
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).await?;
    ClientMessage::decode_body(flag, Bytes::from(body))
}

pub async fn write_client_message<W>(
    writer: &mut W,
    message: &ClientMessage,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = message.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
