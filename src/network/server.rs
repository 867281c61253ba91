//! TCP server and connection handling
//!
//! Accepts and dials peer connections and turns socket activity into
//! callbacks carrying the peer address and raw frame bytes. The layer is
//! byte-agnostic: envelopes are decoded above it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = *b"PEER";

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Magic (4) + Length (4)
const HEADER_LEN: usize = 8;

/// How long a single frame write may take before the peer is considered stuck
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection layer errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Server closed")]
    Closed,
    #[error("Server already started")]
    AlreadyStarted,
    #[error("No connection to {0}")]
    NotConnected(String),
    #[error("Write to {0} timed out")]
    WriteTimeout(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Length-prefixed frame codec
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", item.len()),
            ));
        }

        dst.reserve(HEADER_LEN + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        // Partial frame, wait for the rest
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

/// Socket event callbacks, implemented once by the node and injected at construction
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete frame arrived from `addr`
    fn on_message(&self, addr: &str, frame: Bytes);
    /// A connection to `addr` opened
    fn on_connect(&self, addr: &str);
    /// The connection to `addr` closed
    fn on_disconnect(&self, addr: &str);
}

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// A live peer connection
struct Connection {
    id: u64,
    /// Key this connection is registered under; changes on rebind
    addr: RwLock<String>,
    writer: tokio::sync::Mutex<FrameSink>,
    /// Stops this connection's reader, child of the server shutdown token
    cancel: CancellationToken,
}

impl Connection {
    fn addr(&self) -> String {
        self.addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// State shared between the server handle and its tasks
struct Shared {
    handler: Arc<dyn ConnectionHandler>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Shared {
    fn connections(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connections_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a stream under `key` and hand back its read half
    fn register(&self, stream: TcpStream, key: String) -> (Arc<Connection>, FrameStream) {
        let (writer, reader) = Framed::new(stream, FrameCodec).split();
        let connection = Arc::new(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr: RwLock::new(key.clone()),
            writer: tokio::sync::Mutex::new(writer),
            cancel: self.shutdown.child_token(),
        });

        if self
            .connections_mut()
            .insert(key.clone(), connection.clone())
            .is_some()
        {
            log::debug!("Replaced existing connection to {}", key);
        }

        (connection, reader)
    }

    /// Drop a connection if it is still the one registered under its key.
    /// Returns the key it was removed from.
    fn unregister(&self, connection: &Connection) -> Option<String> {
        let addr = connection.addr();
        let mut connections = self.connections_mut();
        match connections.get(&addr) {
            Some(current) if current.id == connection.id => {
                connections.remove(&addr);
                Some(addr)
            }
            _ => None,
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    log::info!("Incoming connection from {}", addr);
                    let (connection, reader) = self.register(stream, addr.to_string());
                    self.handler.on_connect(&addr.to_string());

                    let shared = self.clone();
                    self.tasks
                        .spawn(async move { shared.read_loop(connection, reader).await });
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        log::debug!("Accept loop stopped");
    }

    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>, mut reader: FrameStream) {
        loop {
            let frame = tokio::select! {
                _ = connection.cancel.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    self.handler.on_message(&connection.addr(), frame.freeze());
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", connection.addr(), e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", connection.addr());
                    break;
                }
            }
        }

        // Cleanup
        if let Some(addr) = self.unregister(&connection) {
            self.handler.on_disconnect(&addr);
        }
    }
}

/// Event-driven TCP server for peer connections
pub struct Server {
    bind_addr: String,
    local_addr: Mutex<Option<SocketAddr>>,
    shared: Arc<Shared>,
}

impl Server {
    /// Create a server that will listen on `bind_addr` once started
    pub fn new(bind_addr: impl Into<String>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            local_addr: Mutex::new(None),
            shared: Arc::new(Shared {
                handler,
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Bind the listener and start accepting connections
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.shared.is_closed() {
            return Err(ServerError::Closed);
        }
        if self.local_addr().is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener =
            TcpListener::bind(&self.bind_addr)
                .await
                .map_err(|source| ServerError::BindFailed {
                    addr: self.bind_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        log::info!("Server listening on {}", local_addr);

        let shared = self.shared.clone();
        self.shared
            .tasks
            .spawn(async move { shared.accept_loop(listener).await });

        Ok(local_addr)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Dial a peer. The connection is keyed by `addr` as given.
    pub async fn connect(&self, addr: &str) -> Result<(), ServerError> {
        if self.shared.is_closed() {
            return Err(ServerError::Closed);
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ServerError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        // Stopped while dialing
        if self.shared.is_closed() {
            return Err(ServerError::Closed);
        }
        log::info!("Connected to peer {}", addr);

        let (connection, reader) = self.shared.register(stream, addr.to_string());
        self.shared.handler.on_connect(addr);

        let shared = self.shared.clone();
        self.shared
            .tasks
            .spawn(async move { shared.read_loop(connection, reader).await });

        Ok(())
    }

    /// Send one frame to a connected peer
    pub async fn send_message(&self, addr: &str, frame: Bytes) -> Result<(), ServerError> {
        if self.shared.is_closed() {
            return Err(ServerError::Closed);
        }

        let connection = self
            .shared
            .connections()
            .get(addr)
            .cloned()
            .ok_or_else(|| ServerError::NotConnected(addr.to_string()))?;

        let result = {
            let mut writer = connection.writer.lock().await;
            match tokio::time::timeout(WRITE_TIMEOUT, writer.send(frame)).await {
                Ok(result) => result.map_err(ServerError::IoError),
                Err(_) => Err(ServerError::WriteTimeout(addr.to_string())),
            }
        };

        if let Err(e) = &result {
            log::warn!("Write to {} failed: {}", addr, e);
            if let Some(addr) = self.shared.unregister(&connection) {
                self.shared.handler.on_disconnect(&addr);
            }
        }

        result
    }

    /// Re-key a live connection, e.g. once an inbound peer announces its
    /// listening address. Fails if `from` is unknown or `to` is already taken.
    pub fn rebind(&self, from: &str, to: &str) -> bool {
        if from == to {
            return self.is_connected(from);
        }

        let mut connections = self.shared.connections_mut();
        if connections.contains_key(to) {
            return false;
        }
        let Some(connection) = connections.remove(from) else {
            return false;
        };

        *connection
            .addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = to.to_string();
        connections.insert(to.to_string(), connection);
        log::debug!("Connection {} is now known as {}", from, to);
        true
    }

    /// Close the connection registered under `addr`. No disconnect callback
    /// fires, since the caller already knows.
    pub fn disconnect(&self, addr: &str) -> bool {
        let Some(connection) = self.shared.connections_mut().remove(addr) else {
            return false;
        };
        connection.cancel.cancel();
        log::info!("Closed connection to {}", addr);
        true
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.shared.connections().contains_key(addr)
    }

    /// Keys of all live connections
    pub fn connections(&self) -> Vec<String> {
        self.shared.connections().keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the listener and every connection. Later sends fail with `Closed`.
    pub fn stop(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping network server...");
        self.shared.shutdown.cancel();
        self.shared.connections_mut().clear();
        self.shared.tasks.close();
    }

    /// Wait until every server task has exited. Call after `stop`.
    pub async fn wait(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connect(String),
        Message(String, Bytes),
        Disconnect(String),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl ConnectionHandler for Recorder {
        fn on_message(&self, addr: &str, frame: Bytes) {
            let _ = self.tx.send(Seen::Message(addr.to_string(), frame));
        }

        fn on_connect(&self, addr: &str) {
            let _ = self.tx.send(Seen::Connect(addr.to_string()));
        }

        fn on_disconnect(&self, addr: &str) {
            let _ = self.tx.send(Seen::Disconnect(addr.to_string()));
        }
    }

    fn recording_server() -> (Server, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Server::new("127.0.0.1:0", Arc::new(Recorder { tx })), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        codec.encode(Bytes::from_static(b"world"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"world");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let mut codec = FrameCodec;
        let mut encoded = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"split across reads"), &mut encoded)
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[5..12]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[12..]);
        assert_eq!(
            &codec.decode(&mut buf).unwrap().unwrap()[..],
            b"split across reads"
        );
    }

    #[test]
    fn test_bad_frames_rejected() {
        let mut codec = FrameCodec;

        let mut bad_magic = BytesMut::from(&b"NOPE\x00\x00\x00\x01x"[..]);
        assert!(codec.decode(&mut bad_magic).is_err());

        let mut oversized = BytesMut::new();
        oversized.put_slice(&MAGIC);
        oversized.put_u32(MAX_FRAME_SIZE as u32 + 1);
        assert!(codec.decode(&mut oversized).is_err());
    }

    #[tokio::test]
    async fn test_connect_send_and_disconnect() {
        let (server_a, mut events_a) = recording_server();
        let (server_b, mut events_b) = recording_server();

        let addr_a = server_a.start().await.unwrap().to_string();
        server_b.connect(&addr_a).await.unwrap();
        assert_eq!(next(&mut events_b).await, Seen::Connect(addr_a.clone()));

        let remote_b = match next(&mut events_a).await {
            Seen::Connect(addr) => addr,
            other => panic!("unexpected event {:?}", other),
        };

        server_b
            .send_message(&addr_a, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(
            next(&mut events_a).await,
            Seen::Message(remote_b.clone(), Bytes::from_static(b"ping"))
        );

        server_a
            .send_message(&remote_b, Bytes::from_static(b"pong"))
            .await
            .unwrap();
        assert_eq!(
            next(&mut events_b).await,
            Seen::Message(addr_a.clone(), Bytes::from_static(b"pong"))
        );

        server_b.stop();
        server_b.wait().await;
        assert_eq!(next(&mut events_a).await, Seen::Disconnect(remote_b));

        server_a.stop();
        server_a.wait().await;
    }

    #[tokio::test]
    async fn test_rebind_relabels_connection() {
        let (server_a, mut events_a) = recording_server();
        let (server_b, _events_b) = recording_server();

        let addr_a = server_a.start().await.unwrap().to_string();
        server_b.connect(&addr_a).await.unwrap();
        let remote_b = match next(&mut events_a).await {
            Seen::Connect(addr) => addr,
            other => panic!("unexpected event {:?}", other),
        };

        assert!(server_a.rebind(&remote_b, "127.0.0.1:7777"));
        assert!(!server_a.is_connected(&remote_b));
        assert!(server_a.is_connected("127.0.0.1:7777"));

        server_b
            .send_message(&addr_a, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(
            next(&mut events_a).await,
            Seen::Message("127.0.0.1:7777".into(), Bytes::from_static(b"hi"))
        );

        server_a.stop();
        server_b.stop();
        server_a.wait().await;
        server_b.wait().await;
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let (server_a, mut events_a) = recording_server();
        let (server_b, mut events_b) = recording_server();

        let addr_a = server_a.start().await.unwrap().to_string();
        server_b.connect(&addr_a).await.unwrap();
        assert_eq!(next(&mut events_b).await, Seen::Connect(addr_a.clone()));
        let remote_b = match next(&mut events_a).await {
            Seen::Connect(addr) => addr,
            other => panic!("unexpected event {:?}", other),
        };

        assert!(server_a.disconnect(&remote_b));
        assert!(!server_a.disconnect(&remote_b));
        assert!(!server_a.is_connected(&remote_b));
        assert!(matches!(
            server_a
                .send_message(&remote_b, Bytes::from_static(b"x"))
                .await,
            Err(ServerError::NotConnected(_))
        ));

        // The far side sees the close, the closing side gets no callback
        assert_eq!(next(&mut events_b).await, Seen::Disconnect(addr_a));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events_a.try_recv().is_err());

        server_a.stop();
        server_b.stop();
        server_a.wait().await;
        server_b.wait().await;
    }

    #[tokio::test]
    async fn test_send_errors() {
        let (server, _events) = recording_server();
        server.start().await.unwrap();

        assert!(matches!(
            server
                .send_message("127.0.0.1:1", Bytes::from_static(b"x"))
                .await,
            Err(ServerError::NotConnected(_))
        ));

        server.stop();
        assert!(matches!(
            server
                .send_message("127.0.0.1:1", Bytes::from_static(b"x"))
                .await,
            Err(ServerError::Closed)
        ));
        server.wait().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (first, _e1) = recording_server();
        let addr = first.start().await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let second = Server::new(addr.to_string(), Arc::new(Recorder { tx }));
        assert!(matches!(
            second.start().await,
            Err(ServerError::BindFailed { .. })
        ));

        first.stop();
        first.wait().await;
    }
}
