//! Chunked file transfer
//!
//! A transfer runs in three phases: the receiver sends `file_request`, the
//! owner answers with `file_metadata`, then streams `file_chunk` envelopes.
//! Chunks are addressed by index, so reassembly is order independent and
//! duplicate delivery is harmless.

pub mod metadata;
pub mod sender;
pub mod store;

pub use metadata::{FileMetadata, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use sender::stream_file;
pub use store::{validate_file_id, FileStore, TransferError};
