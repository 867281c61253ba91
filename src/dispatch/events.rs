//! In-process event bus
//!
//! Lets message handlers trigger network actions without holding a reference
//! to the node. Each node owns its own bus, so several nodes can share one
//! process without cross-talk.

use crate::network::message::Payload;
use crate::transfer::FileMetadata;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Event categories subscribers register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SendMessage,
    FileRequest,
    PeerAnnounced,
    ChatReceived,
    FileMetadataStored,
    FileChunkStored,
}

/// Ephemeral in-process notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Send `payload` to `destination`
    SendMessage { destination: String, payload: Payload },
    /// `destination` asked for a file by name or id
    FileRequest { filename: String, destination: String },
    /// The peer on `connection_addr` listens on `listen_addr`
    PeerAnnounced {
        connection_addr: String,
        listen_addr: String,
    },
    /// Chat text arrived from `from`
    ChatReceived { from: String, text: String },
    /// `from` announced a file and its metadata was stored
    FileMetadataStored { from: String, metadata: FileMetadata },
    /// A chunk of `file_id` was written to disk
    FileChunkStored { file_id: String, chunk_index: u64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SendMessage { .. } => EventKind::SendMessage,
            Event::FileRequest { .. } => EventKind::FileRequest,
            Event::PeerAnnounced { .. } => EventKind::PeerAnnounced,
            Event::ChatReceived { .. } => EventKind::ChatReceived,
            Event::FileMetadataStored { .. } => EventKind::FileMetadataStored,
            Event::FileChunkStored { .. } => EventKind::FileChunkStored,
        }
    }
}

/// Token identifying one subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback
pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous publish/subscribe bus
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        before != list.len()
    }

    /// Call every current subscriber of the event's kind, in registration
    /// order, on the caller's task. Subscribers must hand long work off to
    /// their own task.
    pub fn publish(&self, event: &Event) {
        // Snapshot so callbacks may subscribe or publish without deadlocking
        let callbacks: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            log::debug!("No subscribers for {:?}", event.kind());
        }
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of subscribers for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}
