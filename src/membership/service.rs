use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::info;

use super::handshake;
use super::types::{InboundFrame, LinkError, NodeDescriptor, NodeId};
use crate::node::status::StatusHandle;
use crate::protocol::frame::{PeerFrame, PeerMessage, read_frame, write_frame};

pub const CONNECT_RETRIES: u32 = 3;
const CONNECT_CHECK_INTERVAL: Duration = Duration::from_millis(200);
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How often parked peer addresses are dialed again.
    pub retry_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(60),
        }
    }
}

/// Receiving ends handed to the dispatcher and the failover trigger.
pub struct LinkChannels {
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
    pub disconnects: mpsc::UnboundedReceiver<NodeId>,
}

struct PeerLink {
    descriptor: NodeDescriptor,
    link_id: u64,
    outbound: mpsc::UnboundedSender<PeerFrame>,
    reader: Option<AbortHandle>,
}

impl PeerLink {
    fn close(&self) {
        let _ = self.outbound.send(PeerFrame::terminate());
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Persistent TCP links to every other node.
///
/// Each link has one unbounded outbound queue drained by a writer task, so frames
/// to a peer leave in the order they were queued. A reader task forwards inbound
/// frames to the dispatcher. When either side fails the link is dropped from the
/// directory and the node id is reported on the disconnect channel.
pub struct MembershipService {
    pub local: NodeDescriptor,
    peers: DashMap<NodeId, PeerLink>,
    parked: parking_lot::Mutex<Vec<String>>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    disconnect_tx: mpsc::UnboundedSender<NodeId>,
    next_link_id: AtomicU64,
    status: StatusHandle,
    config: LinkConfig,
}

impl MembershipService {
    pub fn new(
        local: NodeDescriptor,
        config: LinkConfig,
        status: StatusHandle,
    ) -> (Arc<Self>, LinkChannels) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnects) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            local,
            peers: DashMap::new(),
            parked: parking_lot::Mutex::new(Vec::new()),
            inbound_tx,
            disconnect_tx,
            next_link_id: AtomicU64::new(1),
            status,
            config,
        });

        (
            service,
            LinkChannels {
                inbound,
                disconnects,
            },
        )
    }

    pub fn start(self: &Arc<Self>, listener: TcpListener) {
        info!("Starting peer link service for node {}...", self.local.node_id);

        let _accept_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.accept_loop(listener).await;
            })
        };

        let _retry_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.retry_loop().await;
            })
        };
    }

    /// Dials `addr` up to `CONNECT_RETRIES` times and performs the handshake.
    ///
    /// A handshake failure on an established connection marks the node `Fatal`.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<NodeDescriptor, LinkError> {
        let mut last_error = None;

        for attempt in 1..=CONNECT_RETRIES {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => return self.finish_dial(stream, addr).await,
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        CONNECT_RETRIES,
                        addr,
                        e
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Connect attempt {}/{} to {} timed out",
                        attempt,
                        CONNECT_RETRIES,
                        addr
                    );
                    last_error = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ));
                }
            }
        }

        Err(LinkError::Unreachable {
            addr: addr.to_string(),
            attempts: CONNECT_RETRIES,
            source: last_error
                .unwrap_or_else(|| std::io::Error::other("no connect attempt was made")),
        })
    }

    /// Like `connect`, but an unreachable peer is parked for the periodic retry loop.
    pub async fn connect_or_park(self: &Arc<Self>, addr: &str) -> Option<NodeDescriptor> {
        match self.connect(addr).await {
            Ok(remote) => Some(remote),
            Err(LinkError::Unreachable { .. }) => {
                info!(
                    "Peer {} unreachable, retrying every {:?}",
                    addr, self.config.retry_interval
                );
                self.parked.lock().push(addr.to_string());
                None
            }
            Err(e) => {
                tracing::error!("Failed to link with {}: {}", addr, e);
                None
            }
        }
    }

    async fn finish_dial(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: &str,
    ) -> Result<NodeDescriptor, LinkError> {
        let _ = stream.set_nodelay(true);

        match handshake::dial(&mut stream, &self.local, self.config.handshake_timeout, addr).await {
            Ok(remote) => {
                self.attach(remote.clone(), stream);
                Ok(remote)
            }
            Err(e) => {
                self.status.fatal(&e.to_string());
                Err(e)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.status.terminated() => break,
            };

            match accepted {
                Ok((mut stream, src)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        let _ = stream.set_nodelay(true);
                        let addr = src.to_string();
                        match handshake::accept(
                            &mut stream,
                            &service.local,
                            service.config.handshake_timeout,
                            &addr,
                        )
                        .await
                        {
                            Ok(remote) => service.attach(remote, stream),
                            Err(e) => service.status.fatal(&e.to_string()),
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept peer connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        tracing::debug!("Peer accept loop stopped");
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.retry_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.status.terminated() => break,
            }

            if self.parked_count() > 0 {
                tracing::debug!("Retrying {} parked peer address(es)", self.parked_count());
            }
            let parked: Vec<String> = std::mem::take(&mut *self.parked.lock());
            for addr in parked {
                match self.connect(&addr).await {
                    Ok(remote) => info!("Reconnected to node {} at {}", remote.node_id, addr),
                    Err(LinkError::Unreachable { .. }) => self.parked.lock().push(addr),
                    Err(e) => tracing::error!("Retry of {} failed: {}", addr, e),
                }
            }
        }
    }

    fn attach(self: &Arc<Self>, remote: NodeDescriptor, stream: TcpStream) {
        let node_id = remote.node_id;
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        info!(
            "Linked with node {} at {}:{} (candidate={})",
            node_id, remote.ip, remote.client_port, remote.is_controller_candidate
        );

        let link = PeerLink {
            descriptor: remote,
            link_id,
            outbound,
            reader: None,
        };
        if let Some(previous) = self.peers.insert(node_id, link) {
            tracing::warn!("Replacing existing link to node {}", node_id);
            previous.close();
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service
                    .writer_loop(node_id, link_id, write_half, outbound_rx)
                    .await;
            });
        }

        let reader = {
            let service = self.clone();
            tokio::spawn(async move {
                service.reader_loop(node_id, link_id, read_half).await;
            })
        };

        if let Some(mut link) = self.peers.get_mut(&node_id)
            && link.link_id == link_id
        {
            link.reader = Some(reader.abort_handle());
        }
    }

    async fn writer_loop(
        self: Arc<Self>,
        node_id: NodeId,
        link_id: u64,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<PeerFrame>,
    ) {
        while let Some(frame) = outbound.recv().await {
            if frame.is_terminate() {
                break;
            }

            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::warn!("Failed to send to node {}: {}", node_id, e);
                self.disconnect(node_id, link_id);
                break;
            }
        }

        tracing::debug!("Writer for node {} stopped", node_id);
    }

    async fn reader_loop(self: Arc<Self>, node_id: NodeId, link_id: u64, mut reader: OwnedReadHalf) {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if self
                        .inbound_tx
                        .send(InboundFrame {
                            from: node_id,
                            frame,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    if e.is_eof() {
                        tracing::debug!("Node {} closed the link", node_id);
                    } else {
                        tracing::warn!("Failed to read from node {}: {}", node_id, e);
                    }
                    self.disconnect(node_id, link_id);
                    break;
                }
            }
        }
    }

    fn disconnect(&self, node_id: NodeId, link_id: u64) {
        let Some((_, link)) = self.peers.remove_if(&node_id, |_, link| link.link_id == link_id)
        else {
            return;
        };

        link.close();

        if self.status.is_active() {
            tracing::warn!("Lost link to node {}", node_id);
            let _ = self.disconnect_tx.send(node_id);
        }
    }

    /// Closes every link without reporting disconnects.
    pub fn close_all(&self) {
        let ids: Vec<NodeId> = self.peers.iter().map(|entry| *entry.key()).collect();
        for node_id in ids {
            if let Some((_, link)) = self.peers.remove(&node_id) {
                link.close();
            }
        }
    }

    pub fn send(&self, node_id: NodeId, message: &PeerMessage) -> Result<(), LinkError> {
        let frame = message.encode()?;
        self.send_frame(node_id, frame)
    }

    pub fn send_frame(&self, node_id: NodeId, frame: PeerFrame) -> Result<(), LinkError> {
        let link = self
            .peers
            .get(&node_id)
            .ok_or(LinkError::NotConnected(node_id))?;

        link.outbound
            .send(frame)
            .map_err(|_| LinkError::NotConnected(node_id))
    }

    /// Queues `message` for every target that is connected. Returns how many were queued.
    pub fn broadcast<I>(&self, targets: I, message: &PeerMessage) -> usize
    where
        I: IntoIterator<Item = NodeId>,
    {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", message.message_type(), e);
                return 0;
            }
        };

        let mut sent = 0;
        for node_id in targets {
            match self.send_frame(node_id, frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Failed to broadcast to node {}: {}", node_id, e),
            }
        }
        sent
    }

    pub fn peer(&self, node_id: NodeId) -> Option<NodeDescriptor> {
        self.peers.get(&node_id).map(|link| link.descriptor.clone())
    }

    /// Connected peers, ordered by node id.
    pub fn peers(&self) -> Vec<NodeDescriptor> {
        let mut peers: Vec<NodeDescriptor> = self
            .peers
            .iter()
            .map(|entry| entry.value().descriptor.clone())
            .collect();
        peers.sort_by_key(|peer| peer.node_id);
        peers
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers().into_iter().map(|peer| peer.node_id).collect()
    }

    pub fn connected_candidates(&self) -> Vec<NodeId> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.is_controller_candidate)
            .map(|peer| peer.node_id)
            .collect()
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.peers.contains_key(&node_id)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Polls `condition` until it holds. Returns `false` if the node stopped first.
    pub async fn wait_until<F>(&self, what: &str, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let mut last_log = tokio::time::Instant::now();

        loop {
            if condition(self) {
                return true;
            }
            if !self.status.is_active() {
                return false;
            }
            if last_log.elapsed() >= WAIT_LOG_INTERVAL {
                info!(
                    "Still waiting for {} ({} peer(s) connected)",
                    what,
                    self.connected_count()
                );
                last_log = tokio::time::Instant::now();
            }
            tokio::time::sleep(CONNECT_CHECK_INTERVAL).await;
        }
    }

    /// Opens the start-up links.
    ///
    /// Candidates dial the candidates listed before them in `roster`, then wait until
    /// every other candidate and finally every cluster node is linked. Ordinary nodes
    /// dial every candidate.
    pub async fn establish_links(
        self: &Arc<Self>,
        roster: &[String],
        own_addr: &str,
        cluster_node_count: usize,
    ) -> bool {
        if !self.local.is_controller_candidate {
            for addr in roster {
                self.connect_or_park(addr).await;
            }
            return self.status.is_active();
        }

        let position = roster
            .iter()
            .position(|addr| addr == own_addr)
            .unwrap_or(roster.len());

        for addr in &roster[..position] {
            self.connect_or_park(addr).await;
        }

        let other_candidates = roster.len().saturating_sub(1);
        if !self
            .wait_until("controller candidates", |m| {
                m.connected_candidates().len() >= other_candidates
            })
            .await
        {
            return false;
        }
        info!("All {} other controller candidate(s) linked", other_candidates);

        let other_nodes = cluster_node_count.saturating_sub(1);
        let linked = self
            .wait_until("cluster nodes", |m| m.connected_count() >= other_nodes)
            .await;
        if linked {
            info!("All {} other cluster node(s) linked", other_nodes);
        }
        linked
    }
}
