//! Routes decoded envelopes to handlers by message kind

use crate::network::message::{Envelope, MessageKind};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Protocol logic for one message kind.
///
/// Handlers are side-effect only. Follow-up network I/O goes through the
/// event bus, never straight to the transport.
pub trait Handler: Send + Sync {
    fn handle(&self, sender_addr: &str, envelope: &Envelope);
}

/// Maps message kinds to handlers
#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<MessageKind, Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The last registration for a kind wins.
    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Hand an envelope to its handler. Envelopes without a handler are
    /// logged and dropped; returns whether a handler ran.
    pub fn dispatch(&self, sender_addr: &str, envelope: &Envelope) -> bool {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.kind())
            .cloned();

        match handler {
            Some(handler) => {
                handler.handle(sender_addr, envelope);
                true
            }
            None => {
                log::warn!(
                    "No handler for {} from {}, dropping",
                    envelope.kind(),
                    sender_addr
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Payload;
    use std::sync::Mutex;

    struct Recording {
        tag: &'static str,
        seen: Arc<Mutex<Vec<(String, &'static str)>>>,
    }

    impl Handler for Recording {
        fn handle(&self, sender_addr: &str, _envelope: &Envelope) {
            self.seen
                .lock()
                .unwrap()
                .push((sender_addr.to_string(), self.tag));
        }
    }

    #[test]
    fn test_dispatch_to_registered_handler() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register_handler(
            MessageKind::Ping,
            Arc::new(Recording {
                tag: "ping",
                seen: seen.clone(),
            }),
        );

        assert!(router.dispatch("peer", &Envelope::new(Payload::ping(), "peer")));
        assert_eq!(*seen.lock().unwrap(), vec![("peer".to_string(), "ping")]);
    }

    #[test]
    fn test_last_registration_wins() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            router.register_handler(
                MessageKind::Chat,
                Arc::new(Recording {
                    tag,
                    seen: seen.clone(),
                }),
            );
        }

        router.dispatch("peer", &Envelope::new(Payload::Chat("hi".into()), "peer"));
        assert_eq!(*seen.lock().unwrap(), vec![("peer".to_string(), "second")]);
    }

    #[test]
    fn test_unregistered_kind_is_dropped() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register_handler(
            MessageKind::Ping,
            Arc::new(Recording {
                tag: "ping",
                seen: seen.clone(),
            }),
        );

        for payload in [
            Payload::pong(),
            Payload::Chat("hello".into()),
            Payload::NewPeer("x".into()),
        ] {
            assert!(!router.dispatch("peer", &Envelope::new(payload, "peer")));
        }
        assert!(seen.lock().unwrap().is_empty());
        assert!(!router.has_handler(MessageKind::Pong));
    }
}
