//! Peer Mesh: a small peer-to-peer node in Rust
//!
//! This crate provides a complete P2P node featuring:
//! - Framed JSON envelopes over TCP with a closed set of message kinds
//! - A bounded peer registry fed by seed discovery and ping sweeps
//! - A router and event bus decoupling protocol handlers from the transport
//! - Chunked, resumable file transfer with order-independent reassembly
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_mesh::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), peer_mesh::NodeError> {
//! let node = Node::new(NodeConfig {
//!     port: 9001,
//!     seed_nodes: vec!["127.0.0.1:9002".to_string()],
//!     ..Default::default()
//! })?;
//! node.start().await?;
//!
//! // Chat with every connected peer
//! node.send_chat("hello");
//!
//! // Ask a peer for a file it shares
//! node.request_file("127.0.0.1:9002", "notes.txt").await?;
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod network;
pub mod transfer;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use dispatch::{Event, EventBus, EventKind, Handler, Router};
pub use network::{Envelope, MessageKind, Node, NodeError, NodeState, Payload, PeerRegistry};
pub use transfer::{FileMetadata, FileStore, TransferError};
