//! Registry Client
//!
//! A minimal client for one server connection. Requests are correlated with their
//! responses by request id: each in-flight request parks a one-shot sender in the
//! pending map, and the reader task completes and removes it when the response
//! arrives. Service-changed pushes from the server are acknowledged and queued for
//! `next_change`.

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::membership::types::NodeId;
use crate::partition::types::SlotAllocation;
use crate::protocol::client::{
    ClientMessage, ClientPayload, ClientRequest, ClientResponse, InstanceAddress, RequestId,
    RequestResult, read_client_message, write_client_message,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Address list pushed by the server after a service changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChange {
    pub service_name: String,
    pub addresses: Vec<String>,
}

type PendingRequests = DashMap<RequestId, oneshot::Sender<ClientResponse>>;

pub struct RegistryClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Arc<PendingRequests>,
    changes: Mutex<mpsc::UnboundedReceiver<ServiceChange>>,
    request_timeout: Duration,
    tasks: Vec<AbortHandle>,
}

impl RegistryClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (changes_tx, changes) = mpsc::unbounded_channel();
        let pending: Arc<PendingRequests> = Arc::new(DashMap::new());

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_client_message(&mut writer, &message).await {
                    tracing::warn!("Registry client write failed: {}", e);
                    break;
                }
            }
        });

        let reader_task = tokio::spawn(Self::reader_loop(
            reader,
            pending.clone(),
            outbound.clone(),
            changes_tx,
        ));

        Ok(Self {
            outbound,
            pending,
            changes: Mutex::new(changes),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tasks: vec![writer_task.abort_handle(), reader_task.abort_handle()],
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn reader_loop(
        mut reader: OwnedReadHalf,
        pending: Arc<PendingRequests>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        changes: mpsc::UnboundedSender<ServiceChange>,
    ) {
        loop {
            let message = match read_client_message(&mut reader).await {
                Ok(message) => message,
                Err(e) => {
                    if !e.is_eof() {
                        tracing::warn!("Registry client read failed: {}", e);
                    }
                    break;
                }
            };

            match message.payload {
                ClientPayload::Response(response) => match pending.remove(&message.id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!("Response {} has no waiting request", message.id),
                },
                ClientPayload::Request(ClientRequest::ServiceChanged {
                    service_name,
                    addresses,
                }) => {
                    let _ = outbound.send(ClientMessage::response(
                        message.id,
                        ClientResponse::ServiceChanged,
                    ));
                    let _ = changes.send(ServiceChange {
                        service_name,
                        addresses,
                    });
                }
                ClientPayload::Request(other) => {
                    tracing::warn!("Unexpected {:?} request from server", other.request_type());
                }
            }
        }

        pending.clear();
    }

    /// Sends `request` and waits for the response carrying the same id.
    pub async fn request(&self, request: ClientRequest) -> Result<ClientResponse> {
        let message = ClientMessage::request(request);
        let id = message.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.outbound.send(message).is_err() {
            self.pending.remove(&id);
            return Err(anyhow!("Connection closed"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow!("Connection closed before response {}", id)),
            Err(_) => {
                self.pending.remove(&id);
                Err(anyhow!("Request {} timed out after {:?}", id, self.request_timeout))
            }
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn register(&self, service_name: &str, ip: &str, port: u16) -> Result<RequestResult> {
        match self
            .request(ClientRequest::Register(instance(service_name, ip, port)))
            .await?
        {
            ClientResponse::Register(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn heartbeat(&self, service_name: &str, ip: &str, port: u16) -> Result<RequestResult> {
        match self
            .request(ClientRequest::Heartbeat(instance(service_name, ip, port)))
            .await?
        {
            ClientResponse::Heartbeat(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn subscribe(&self, service_name: &str) -> Result<Vec<String>> {
        match self
            .request(ClientRequest::Subscribe {
                service_name: service_name.to_string(),
            })
            .await?
        {
            ClientResponse::Subscribe(addresses) => Ok(addresses),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fetch_slots_allocation(&self) -> Result<SlotAllocation> {
        match self.request(ClientRequest::FetchSlotsAllocation).await? {
            ClientResponse::SlotsAllocation(table) => Ok(table),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fetch_server_addresses(&self) -> Result<Vec<String>> {
        match self.request(ClientRequest::FetchServerAddresses).await? {
            ClientResponse::ServerAddresses(addresses) => Ok(addresses),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fetch_server_node_id(&self) -> Result<NodeId> {
        match self.request(ClientRequest::FetchServerNodeId).await? {
            ClientResponse::ServerNodeId(node_id) => Ok(node_id),
            other => Err(unexpected(&other)),
        }
    }

    /// Next pushed change, or `None` if none arrives within `timeout`.
    pub async fn next_change(&self, timeout: Duration) -> Option<ServiceChange> {
        let mut changes = self.changes.lock().await;
        tokio::time::timeout(timeout, changes.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn instance(service_name: &str, ip: &str, port: u16) -> InstanceAddress {
    InstanceAddress {
        service_name: service_name.to_string(),
        ip: ip.to_string(),
        port,
    }
}

fn unexpected(response: &ClientResponse) -> anyhow::Error {
    anyhow!("Unexpected {:?} response", response.request_type())
}
