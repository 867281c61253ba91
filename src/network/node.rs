//! P2P Node implementation
//!
//! The main node that orchestrates all networking components: it wires the
//! connection layer to the router, serves bus events with network sends, and
//! runs the seed discovery and ping sweep loops.

use crate::config::{ConfigError, NodeConfig};
use crate::dispatch::{register_default_handlers, Event, EventBus, EventKind, Router};
use crate::network::message::{CodecError, Envelope, Payload};
use crate::network::peer::{Admission, PeerRegistry};
use crate::network::server::{ConnectionHandler, Server, ServerError};
use crate::transfer::{stream_file, FileMetadata, FileStore, TransferError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Network error: {0}")]
    Server(#[from] ServerError),
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Node is {0:?}")]
    InvalidState(NodeState),
}

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    ShuttingDown,
    Stopped,
}

/// Connection callbacks: keep the registry in step with sockets and feed
/// frames to the router
struct NodeConnections {
    peers: Arc<PeerRegistry>,
    router: Arc<Router>,
    /// For closing evicted peers; weak so the server does not own its node
    node: Weak<Node>,
}

impl NodeConnections {
    fn dispatch(&self, addr: &str, envelope: &Envelope) {
        // Handlers do blocking file I/O; keep it off the worker's other tasks
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.router.dispatch(addr, envelope));
            }
            _ => {
                self.router.dispatch(addr, envelope);
            }
        }
    }
}

impl ConnectionHandler for NodeConnections {
    fn on_message(&self, addr: &str, frame: Bytes) {
        self.peers.touch(addr);
        match Envelope::from_bytes(&frame) {
            Ok(envelope) => {
                log::debug!(
                    "Received {} from {} (sender {})",
                    envelope.kind(),
                    addr,
                    envelope.sender
                );
                self.dispatch(addr, &envelope);
            }
            Err(e) => log::warn!("Dropping frame from {}: {}", addr, e),
        }
    }

    fn on_connect(&self, addr: &str) {
        log::info!("Peer connected: {}", addr);
        match self.peers.add_peer(addr) {
            Admission::Rejected => log::info!("Peer registry full, not tracking {}", addr),
            Admission::AddedAfterEvicting(evicted) => {
                log::info!("Peer registry full, evicted {} for {}", evicted, addr);
                if let Some(node) = self.node.upgrade() {
                    node.server.disconnect(&evicted);
                }
            }
            Admission::Added | Admission::AlreadyPresent => {}
        }
    }

    fn on_disconnect(&self, addr: &str) {
        self.peers.remove_peer(addr);
        log::info!("Peer disconnected: {}", addr);
    }
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    peers: Arc<PeerRegistry>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    files: Arc<FileStore>,
    server: Server,
    state: Mutex<NodeState>,
    /// Address announced to peers and stamped on outgoing envelopes
    self_addr: RwLock<String>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    send_pool: Arc<Semaphore>,
    transfer_pool: Arc<Semaphore>,
}

impl Node {
    /// Create a new node with the built-in handlers registered
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        config.validate()?;

        let files = Arc::new(FileStore::with_chunk_size(
            &config.data_dir,
            config.chunk_size,
        )?);
        let peers = Arc::new(PeerRegistry::new(config.max_peers, config.eviction));
        let router = Arc::new(Router::new());
        let events = Arc::new(EventBus::new());
        register_default_handlers(&router, &events, &peers, &files);

        let node = Arc::new_cyclic(|weak| Self {
            server: Server::new(
                config.listen_addr(),
                Arc::new(NodeConnections {
                    peers: peers.clone(),
                    router: router.clone(),
                    node: weak.clone(),
                }),
            ),
            self_addr: RwLock::new(config.listen_addr()),
            send_pool: Arc::new(Semaphore::new(config.max_concurrent_sends)),
            transfer_pool: Arc::new(Semaphore::new(config.max_concurrent_transfers)),
            config,
            peers,
            router,
            events,
            files,
            state: Mutex::new(NodeState::Created),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        node.subscribe_events();

        Ok(node)
    }

    /// Serve handler-published events. Subscribers hold a weak reference so
    /// the bus does not keep the node alive.
    fn subscribe_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.events.subscribe(EventKind::SendMessage, move |event| {
            if let (Some(node), Event::SendMessage { destination, payload }) =
                (weak.upgrade(), event)
            {
                node.spawn_send(destination.clone(), payload.clone());
            }
        });

        let weak = Arc::downgrade(self);
        self.events.subscribe(EventKind::FileRequest, move |event| {
            if let (Some(node), Event::FileRequest { filename, destination }) =
                (weak.upgrade(), event)
            {
                node.spawn_file_transfer(destination.clone(), filename.clone());
            }
        });

        let weak = Arc::downgrade(self);
        self.events.subscribe(EventKind::PeerAnnounced, move |event| {
            if let (
                Some(node),
                Event::PeerAnnounced {
                    connection_addr,
                    listen_addr,
                },
            ) = (weak.upgrade(), event)
            {
                node.adopt_listen_addr(connection_addr, listen_addr);
            }
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> NodeState {
        *self.lock_state()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address this node announces to peers
    pub fn self_addr(&self) -> String {
        self.self_addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Current peer addresses
    pub fn peers(&self) -> Vec<String> {
        self.peers.list_peers()
    }

    /// Start listening and launch the background loops
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        {
            let mut state = self.lock_state();
            if *state != NodeState::Created {
                return Err(NodeError::InvalidState(*state));
            }
            *state = NodeState::Started;
        }

        let local_addr = match self.server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                *self.lock_state() = NodeState::Created;
                return Err(e.into());
            }
        };

        let host = if local_addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            local_addr.ip().to_string()
        };
        let advertised = format!("{}:{}", host, local_addr.port());
        *self
            .self_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = advertised.clone();
        log::info!("Node started on {}", advertised);

        let node = self.clone();
        self.tasks.spawn(async move { node.discovery_loop().await });

        let node = self.clone();
        self.tasks.spawn(async move { node.ping_loop().await });

        Ok(local_addr)
    }

    /// Stop the background loops and the server, then wait for every task
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                NodeState::Started => *state = NodeState::ShuttingDown,
                NodeState::Created => {
                    *state = NodeState::Stopped;
                    self.server.stop();
                    return;
                }
                NodeState::ShuttingDown | NodeState::Stopped => return,
            }
        }

        log::info!("Shutting down node...");
        self.shutdown.cancel();
        self.server.stop();

        self.tasks.close();
        self.tasks.wait().await;
        self.server.wait().await;

        *self.lock_state() = NodeState::Stopped;
        log::info!("Node shutdown complete.");
    }

    /// Send a payload to one peer. A failed send evicts the peer.
    pub async fn send_message(&self, addr: &str, payload: Payload) -> Result<(), NodeError> {
        let envelope = Envelope::new(payload, self.self_addr());
        let bytes = envelope.to_bytes()?;

        if let Err(e) = self.server.send_message(addr, Bytes::from(bytes)).await {
            if self.peers.remove_peer(addr).is_some() {
                log::warn!("Evicted peer {} after failed send: {}", addr, e);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a payload to every peer. Returns the number of sends queued.
    pub fn broadcast(self: &Arc<Self>, payload: Payload) -> usize {
        let peers = self.peers.list_peers();
        for addr in &peers {
            self.spawn_send(addr.clone(), payload.clone());
        }
        peers.len()
    }

    /// Send chat text to every peer
    pub fn send_chat(self: &Arc<Self>, text: &str) -> usize {
        self.broadcast(Payload::Chat(text.to_string()))
    }

    /// Ask a peer for a file by name or id
    pub async fn request_file(&self, peer: &str, name_or_id: &str) -> Result<(), NodeError> {
        self.send_message(peer, Payload::FileRequest(name_or_id.to_string()))
            .await
    }

    /// Copy a local file into storage so peers can request it
    pub fn share_file(&self, path: &Path) -> Result<FileMetadata, NodeError> {
        Ok(self.files.register_path(path)?)
    }

    /// Share a local file and push it to a peer unrequested
    pub async fn send_file(&self, destination: &str, path: &Path) -> Result<u64, NodeError> {
        let metadata = self.share_file(path)?;
        self.transmit_file(destination, &metadata).await
    }

    /// Send metadata, then the chunk stream. Returns the chunk count.
    pub async fn transmit_file(
        &self,
        destination: &str,
        metadata: &FileMetadata,
    ) -> Result<u64, NodeError> {
        self.send_message(destination, Payload::FileMetadata(metadata.clone()))
            .await?;

        let file = tokio::fs::File::from_std(self.files.open_for_read(&metadata.file_id)?);
        let chunks = stream_file(file, metadata, |chunk| async move {
            self.send_message(destination, Payload::FileChunk(chunk))
                .await
                .map_err(|e| TransferError::SendFailed(e.to_string()))
        })
        .await?;

        log::info!(
            "Sent {} ({} chunks) to {}",
            metadata.file_id,
            chunks,
            destination
        );
        Ok(chunks)
    }

    /// Dial a peer, introduce ourselves and add it to the registry
    pub async fn connect_to(&self, addr: &str) -> Result<(), NodeError> {
        log::info!("Connecting to peer: {}", addr);
        if !self.server.is_connected(addr) {
            self.server.connect(addr).await?;
        }
        self.send_message(addr, Payload::NewPeer(self.self_addr()))
            .await?;
        self.peers.add_peer(addr);
        Ok(())
    }

    /// Ping every peer with bounded concurrency. A failed ping evicts the peer.
    pub async fn ping_sweep(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let peers = self.peers.list_peers();
        log::debug!("Pinging {} peers", peers.len());

        let mut handles = Vec::with_capacity(peers.len());
        for addr in peers {
            let Some(permit) = self.acquire(&self.send_pool).await else {
                break;
            };
            let node = self.clone();
            handles.push(self.tasks.spawn(async move {
                if let Err(e) = node.send_message(&addr, Payload::ping()).await {
                    log::warn!("Error sending ping to {}: {}", addr, e);
                }
                drop(permit);
            }));
        }
        handles
    }

    /// Wait for a pool slot unless the node is shutting down
    async fn acquire(&self, pool: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            permit = pool.clone().acquire_owned() => permit.ok(),
        }
    }

    fn spawn_send(self: &Arc<Self>, destination: String, payload: Payload) {
        if self.shutdown.is_cancelled() {
            log::debug!("Node shutting down, not sending to {}", destination);
            return;
        }
        let node = self.clone();
        self.tasks.spawn(async move {
            let Some(_permit) = node.acquire(&node.send_pool).await else {
                return;
            };
            if let Err(e) = node.send_message(&destination, payload).await {
                log::warn!("Error sending message to {}: {}", destination, e);
            }
        });
    }

    fn spawn_file_transfer(self: &Arc<Self>, destination: String, name_or_id: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let node = self.clone();
        self.tasks.spawn(async move {
            let metadata = match node.files.resolve(&name_or_id) {
                Ok(metadata) => metadata,
                Err(TransferError::NotFound(_)) => {
                    log::info!(
                        "Requested file {} not found, no response sent to {}",
                        name_or_id,
                        destination
                    );
                    return;
                }
                Err(e) => {
                    log::error!("Failed to look up {}: {}", name_or_id, e);
                    return;
                }
            };

            let Some(_permit) = node.acquire(&node.transfer_pool).await else {
                return;
            };
            if let Err(e) = node.transmit_file(&destination, &metadata).await {
                log::warn!(
                    "Transfer of {} to {} failed: {}",
                    metadata.file_id,
                    destination,
                    e
                );
            }
        });
    }

    /// An inbound peer told us where it listens: key its connection and
    /// registry entry by that address from now on
    fn adopt_listen_addr(&self, connection_addr: &str, listen_addr: &str) {
        if connection_addr == listen_addr {
            return;
        }
        if self.server.rebind(connection_addr, listen_addr) {
            self.peers.remove_peer(connection_addr);
            self.peers.add_peer(listen_addr);
        } else {
            log::debug!(
                "Keeping {} as is, {} already has a connection",
                connection_addr,
                listen_addr
            );
        }
    }

    async fn dial_seeds(&self) {
        let self_addr = self.self_addr();
        for seed in &self.config.seed_nodes {
            if *seed == self_addr || self.server.is_connected(seed) {
                continue;
            }
            if let Err(e) = self.connect_to(seed).await {
                log::warn!("Error connecting to seed node {}: {}", seed, e);
            }
        }
    }

    async fn discovery_loop(&self) {
        let mut interval = tokio::time::interval(self.config.discovery_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            // First tick fires immediately, so seeds are dialed at startup
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.dial_seeds() => {}
            }
        }
        log::debug!("Discovery loop stopped");
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.ping_interval());
        // Skip the immediate first tick
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.ping_sweep().await;
                }
            }
        }
        log::debug!("Ping loop stopped");
    }
}
