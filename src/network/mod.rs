//! P2P Networking module
//!
//! Provides the peer-to-peer transport and the node that drives it.
//!
//! # Features
//! - Length-prefixed JSON envelopes over TCP
//! - Bounded peer registry with liveness tracking
//! - Seed discovery and periodic ping sweeps
//! - Graceful shutdown that waits for in-flight work

pub mod message;
pub mod node;
pub mod peer;
pub mod server;

pub use message::{CodecError, Envelope, FileChunk, MessageKind, Payload};
pub use node::{Node, NodeError, NodeState};
pub use peer::{Admission, EvictionPolicy, PeerRecord, PeerRegistry, PeerState, MAX_PEERS};
pub use server::{
    ConnectionHandler, FrameCodec, Server, ServerError, MAGIC, MAX_FRAME_SIZE,
};
