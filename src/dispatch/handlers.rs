//! Built-in protocol handlers

use crate::dispatch::events::{Event, EventBus};
use crate::dispatch::router::{Handler, Router};
use crate::network::message::{Envelope, MessageKind, Payload};
use crate::network::peer::PeerRegistry;
use crate::transfer::{FileStore, TransferError};
use std::sync::Arc;

/// Answers `ping` with a `pong` to the sender
pub struct PingHandler {
    events: Arc<EventBus>,
}

impl PingHandler {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

impl Handler for PingHandler {
    fn handle(&self, sender_addr: &str, _envelope: &Envelope) {
        log::debug!("Received ping from {}", sender_addr);
        self.events.publish(&Event::SendMessage {
            destination: sender_addr.to_string(),
            payload: Payload::pong(),
        });
    }
}

/// Records liveness on `pong`
pub struct PongHandler {
    peers: Arc<PeerRegistry>,
}

impl PongHandler {
    pub fn new(peers: Arc<PeerRegistry>) -> Self {
        Self { peers }
    }
}

impl Handler for PongHandler {
    fn handle(&self, sender_addr: &str, _envelope: &Envelope) {
        log::debug!("Received pong from {}", sender_addr);
        self.peers.touch(sender_addr);
    }
}

/// Surfaces chat text to whoever subscribed to `ChatReceived`
pub struct ChatHandler {
    events: Arc<EventBus>,
}

impl ChatHandler {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

impl Handler for ChatHandler {
    fn handle(&self, sender_addr: &str, envelope: &Envelope) {
        let Payload::Chat(text) = &envelope.payload else {
            log::warn!("Invalid chat message data from {}", sender_addr);
            return;
        };
        self.events.publish(&Event::ChatReceived {
            from: sender_addr.to_string(),
            text: text.clone(),
        });
    }
}

/// Learns the listening address behind an inbound connection
pub struct NewPeerHandler {
    events: Arc<EventBus>,
}

impl NewPeerHandler {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

impl Handler for NewPeerHandler {
    fn handle(&self, sender_addr: &str, envelope: &Envelope) {
        let Payload::NewPeer(listen_addr) = &envelope.payload else {
            log::warn!("Invalid new_peer data from {}", sender_addr);
            return;
        };
        if listen_addr.is_empty() {
            log::warn!("Empty new_peer announcement from {}", sender_addr);
            return;
        }
        log::info!("Peer {} listens on {}", sender_addr, listen_addr);
        self.events.publish(&Event::PeerAnnounced {
            connection_addr: sender_addr.to_string(),
            listen_addr: listen_addr.clone(),
        });
    }
}

/// Turns `file_request` into a `FileRequest` event for the node to serve
pub struct FileRequestHandler {
    events: Arc<EventBus>,
}

impl FileRequestHandler {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

impl Handler for FileRequestHandler {
    fn handle(&self, sender_addr: &str, envelope: &Envelope) {
        let Payload::FileRequest(filename) = &envelope.payload else {
            log::warn!("Invalid file request data from {}", sender_addr);
            return;
        };
        log::info!("Received file request for {} from {}", filename, sender_addr);
        self.events.publish(&Event::FileRequest {
            filename: filename.clone(),
            destination: sender_addr.to_string(),
        });
    }
}

/// Stores metadata announced by the sending peer
pub struct FileMetadataHandler {
    files: Arc<FileStore>,
    events: Arc<EventBus>,
}

impl FileMetadataHandler {
    pub fn new(files: Arc<FileStore>, events: Arc<EventBus>) -> Self {
        Self { files, events }
    }
}

impl Handler for FileMetadataHandler {
    fn handle(&self, sender_addr: &str, envelope: &Envelope) {
        let Payload::FileMetadata(metadata) = &envelope.payload else {
            log::warn!("Invalid file metadata from {}", sender_addr);
            return;
        };
        match self.files.store_metadata(metadata) {
            Ok(()) => {
                log::info!(
                    "Stored metadata for {} ({}, {} bytes) from {}",
                    metadata.file_id,
                    metadata.filename,
                    metadata.file_size,
                    sender_addr
                );
                self.events.publish(&Event::FileMetadataStored {
                    from: sender_addr.to_string(),
                    metadata: metadata.clone(),
                });
            }
            Err(e @ (TransferError::InvalidFileId(_) | TransferError::InvalidMetadata(_))) => {
                log::warn!("Dropping file metadata from {}: {}", sender_addr, e)
            }
            Err(e) => log::error!("Error storing file metadata: {}", e),
        }
    }
}

/// Writes received chunks at their arithmetic offset.
///
/// The write is blocking file I/O on the dispatching task.
pub struct FileChunkHandler {
    files: Arc<FileStore>,
    events: Arc<EventBus>,
}

impl FileChunkHandler {
    pub fn new(files: Arc<FileStore>, events: Arc<EventBus>) -> Self {
        Self { files, events }
    }
}

impl Handler for FileChunkHandler {
    fn handle(&self, sender_addr: &str, envelope: &Envelope) {
        let Payload::FileChunk(chunk) = &envelope.payload else {
            log::warn!("Invalid file chunk data from {}", sender_addr);
            return;
        };

        match self
            .files
            .write_received_chunk(&chunk.file_id, chunk.chunk_index, &chunk.chunk_data)
        {
            Ok(()) => {
                log::debug!(
                    "Wrote chunk {} of {} ({} bytes)",
                    chunk.chunk_index,
                    chunk.file_id,
                    chunk.chunk_data.len()
                );
                self.events.publish(&Event::FileChunkStored {
                    file_id: chunk.file_id.clone(),
                    chunk_index: chunk.chunk_index,
                });
            }
            Err(e @ TransferError::ChunkOutOfRange { .. }) => {
                log::warn!("Dropping chunk from {}: {}", sender_addr, e)
            }
            Err(e) => log::warn!("Error writing chunk to file from {}: {}", sender_addr, e),
        }
    }
}

/// Register every built-in handler on `router`
pub fn register_default_handlers(
    router: &Router,
    events: &Arc<EventBus>,
    peers: &Arc<PeerRegistry>,
    files: &Arc<FileStore>,
) {
    router.register_handler(MessageKind::Ping, Arc::new(PingHandler::new(events.clone())));
    router.register_handler(MessageKind::Pong, Arc::new(PongHandler::new(peers.clone())));
    router.register_handler(MessageKind::Chat, Arc::new(ChatHandler::new(events.clone())));
    router.register_handler(
        MessageKind::NewPeer,
        Arc::new(NewPeerHandler::new(events.clone())),
    );
    router.register_handler(
        MessageKind::FileRequest,
        Arc::new(FileRequestHandler::new(events.clone())),
    );
    router.register_handler(
        MessageKind::FileMetadata,
        Arc::new(FileMetadataHandler::new(files.clone(), events.clone())),
    );
    router.register_handler(
        MessageKind::FileChunk,
        Arc::new(FileChunkHandler::new(files.clone(), events.clone())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::events::EventKind;
    use crate::network::message::FileChunk;
    use crate::network::peer::EvictionPolicy;
    use crate::transfer::FileMetadata;
    use std::sync::Mutex;

    struct Fixture {
        router: Router,
        events: Arc<EventBus>,
        files: Arc<FileStore>,
        seen: Arc<Mutex<Vec<Event>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let peers = Arc::new(PeerRegistry::new(8, EvictionPolicy::RejectNew));
        let files = Arc::new(FileStore::new(dir.path()).unwrap());
        let router = Router::new();
        register_default_handlers(&router, &events, &peers, &files);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::SendMessage,
            EventKind::FileRequest,
            EventKind::PeerAnnounced,
            EventKind::ChatReceived,
            EventKind::FileMetadataStored,
            EventKind::FileChunkStored,
        ] {
            let seen = seen.clone();
            events.subscribe(kind, move |event| seen.lock().unwrap().push(event.clone()));
        }

        Fixture {
            router,
            events,
            files,
            seen,
            _dir: dir,
        }
    }

    #[test]
    fn test_ping_publishes_single_pong() {
        let f = fixture();
        f.router
            .dispatch("10.0.0.1:5000", &Envelope::new(Payload::ping(), "10.0.0.1:9001"));

        assert_eq!(
            *f.seen.lock().unwrap(),
            vec![Event::SendMessage {
                destination: "10.0.0.1:5000".into(),
                payload: Payload::pong(),
            }]
        );
    }

    #[test]
    fn test_chat_and_file_request_events() {
        let f = fixture();
        f.router
            .dispatch("a", &Envelope::new(Payload::Chat("hello".into()), "a"));
        f.router
            .dispatch("a", &Envelope::new(Payload::FileRequest("notes.txt".into()), "a"));
        f.router
            .dispatch("a", &Envelope::new(Payload::NewPeer("127.0.0.1:9002".into()), "a"));

        assert_eq!(
            *f.seen.lock().unwrap(),
            vec![
                Event::ChatReceived {
                    from: "a".into(),
                    text: "hello".into()
                },
                Event::FileRequest {
                    filename: "notes.txt".into(),
                    destination: "a".into()
                },
                Event::PeerAnnounced {
                    connection_addr: "a".into(),
                    listen_addr: "127.0.0.1:9002".into()
                },
            ]
        );
        assert_eq!(f.events.subscriber_count(EventKind::ChatReceived), 1);
    }

    #[test]
    fn test_metadata_then_chunks_reassemble() {
        let f = fixture();
        let metadata = FileMetadata {
            file_id: "remote1".into(),
            filename: "data.bin".into(),
            file_size: 10,
            chunk_size: 4,
        };
        f.router.dispatch(
            "a",
            &Envelope::new(Payload::FileMetadata(metadata.clone()), "a"),
        );

        // Short final chunk first: its offset must come from the metadata
        for (index, data) in [
            (2u64, &b"89"[..]),
            (0, &b"0123"[..]),
            (1, &b"4567"[..]),
        ] {
            f.router.dispatch(
                "a",
                &Envelope::new(
                    Payload::FileChunk(FileChunk {
                        file_id: "remote1".into(),
                        chunk_index: index,
                        chunk_data: data.to_vec(),
                    }),
                    "a",
                ),
            );
        }

        let stored = std::fs::read(f.files.file_path("remote1").unwrap()).unwrap();
        assert_eq!(stored, b"0123456789");
        assert!(f.files.is_complete("remote1").unwrap());

        let seen = f.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Event::FileMetadataStored {
                from: "a".into(),
                metadata
            }
        );
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_chunks_outside_metadata_are_dropped() {
        let f = fixture();
        let metadata = FileMetadata {
            file_id: "remote2".into(),
            filename: "data.bin".into(),
            file_size: 10,
            chunk_size: 4,
        };
        f.router
            .dispatch("a", &Envelope::new(Payload::FileMetadata(metadata), "a"));

        let chunk = |index: u64, data: &[u8]| {
            Envelope::new(
                Payload::FileChunk(FileChunk {
                    file_id: "remote2".into(),
                    chunk_index: index,
                    chunk_data: data.to_vec(),
                }),
                "a",
            )
        };

        // Stray index far past the end, then a chunk longer than its slot
        f.router.dispatch("a", &chunk(1_000_000_000, b"0123"));
        f.router.dispatch("a", &chunk(2, b"89xx"));
        for (index, data) in [(0u64, &b"0123"[..]), (1, &b"4567"[..]), (2, &b"89"[..])] {
            f.router.dispatch("a", &chunk(index, data));
        }

        let path = f.files.file_path("remote2").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
        assert!(f.files.is_complete("remote2").unwrap());

        let stored: Vec<u64> = f
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::FileChunkStored { chunk_index, .. } => Some(*chunk_index),
                _ => None,
            })
            .collect();
        assert_eq!(stored, vec![0, 1, 2]);
    }

    #[test]
    fn test_bad_chunk_and_metadata_are_dropped() {
        let f = fixture();
        f.router.dispatch(
            "a",
            &Envelope::new(
                Payload::FileChunk(FileChunk {
                    file_id: "../escape".into(),
                    chunk_index: 0,
                    chunk_data: b"x".to_vec(),
                }),
                "a",
            ),
        );
        f.router.dispatch(
            "a",
            &Envelope::new(
                Payload::FileMetadata(FileMetadata {
                    file_id: "zero".into(),
                    filename: "zero.bin".into(),
                    file_size: 1,
                    chunk_size: 0,
                }),
                "a",
            ),
        );

        assert!(f.seen.lock().unwrap().is_empty());
        assert!(matches!(
            f.files.get_metadata("zero"),
            Err(TransferError::NotFound(_))
        ));
    }
}
