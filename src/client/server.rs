use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::info;

use super::processor::RequestProcessor;
use crate::node::status::StatusHandle;
use crate::partition::table::PartitionTable;
use crate::protocol::client::{
    ClientMessage, ClientPayload, ClientRequest, ClientResponse, read_client_message,
    write_client_message,
};
use crate::registry::types::{ChangeNotifier, ConnectionId};

/// Outbound queues of every open client connection.
///
/// Responses and pushed notifications for one connection share its queue, so a
/// client sees them in the order they were produced.
#[derive(Default)]
pub struct ClientConnections {
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<ClientMessage>>,
    next_id: AtomicU64,
}

impl ClientConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ClientMessage>) {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection_id, tx);
        (connection_id, rx)
    }

    pub fn close(&self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
    }

    pub fn send(&self, connection_id: ConnectionId, message: ClientMessage) -> bool {
        match self.connections.get(&connection_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ChangeNotifier for ClientConnections {
    fn notify(&self, connection_id: ConnectionId, service_name: &str, addresses: &[String]) {
        let message = ClientMessage::request(ClientRequest::ServiceChanged {
            service_name: service_name.to_string(),
            addresses: addresses.to_vec(),
        });

        if !self.send(connection_id, message) {
            tracing::debug!(
                "Dropping change of {} for closed connection {}",
                service_name,
                connection_id
            );
        }
    }
}

/// Accepts client connections and serves the registry protocol on them.
pub struct ClientServer {
    processor: Arc<RequestProcessor>,
    connections: Arc<ClientConnections>,
    table: Arc<PartitionTable>,
    status: StatusHandle,
}

impl ClientServer {
    pub fn new(
        processor: Arc<RequestProcessor>,
        connections: Arc<ClientConnections>,
        table: Arc<PartitionTable>,
        status: StatusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            connections,
            table,
            status,
        })
    }

    pub fn start(self: Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Client server listening on {}", addr);
        }

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = self.status.terminated() => break,
                };

                match accepted {
                    Ok((stream, src)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, src.to_string()).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept client connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            tracing::debug!("Client accept loop stopped");
        })
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, src: String) {
        let _ = stream.set_nodelay(true);
        let (connection_id, mut outbound) = self.connections.open();
        let (mut reader, mut writer) = stream.into_split();

        tracing::debug!("Client {} connected as {}", src, connection_id);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = write_client_message(&mut writer, &message).await {
                    tracing::debug!("Failed to write to client {}: {}", connection_id, e);
                    break;
                }
            }
        });

        loop {
            let message = tokio::select! {
                message = read_client_message(&mut reader) => message,
                _ = self.status.terminated() => break,
            };

            match message {
                Ok(message) => self.handle_message(connection_id, message),
                Err(e) => {
                    if e.is_eof() {
                        tracing::debug!("Client {} disconnected", connection_id);
                    } else {
                        tracing::warn!("Closing client {} after bad frame: {}", connection_id, e);
                    }
                    break;
                }
            }
        }

        self.connections.close(connection_id);
        self.table.remove_connection(connection_id);
        writer_task.abort();
    }

    fn handle_message(&self, connection_id: ConnectionId, message: ClientMessage) {
        match &message.payload {
            ClientPayload::Request(_) => {
                if let Some(response) = self.processor.process(connection_id, &message) {
                    self.connections.send(connection_id, response);
                }
            }
            ClientPayload::Response(ClientResponse::ServiceChanged) => {
                tracing::debug!("Client {} acknowledged change {}", connection_id, message.id);
            }
            ClientPayload::Response(other) => {
                tracing::warn!(
                    "Unexpected {:?} response from client {}",
                    other.request_type(),
                    connection_id
                );
            }
        }
    }
}
