//! File metadata record shared between peers

use crate::network::server::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};

/// Default chunk size for newly registered files (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Room for the envelope fields around a hex-encoded chunk
const ENVELOPE_HEADROOM: usize = 4096;

/// Largest chunk whose hex-encoded `file_chunk` envelope still fits in one frame
pub const MAX_CHUNK_SIZE: u32 = ((MAX_FRAME_SIZE - ENVELOPE_HEADROOM) / 2) as u32;

/// Immutable description of a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    /// Fixed for the lifetime of `file_id`
    pub chunk_size: u32,
}

impl FileMetadata {
    /// Total number of chunks, the last one possibly short
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.chunk_size as u64)
    }

    /// Byte offset of a chunk
    pub fn chunk_offset(&self, chunk_index: u64) -> u64 {
        chunk_index.saturating_mul(self.chunk_size as u64)
    }

    /// Length of a chunk, zero when the index is past the end
    pub fn chunk_len(&self, chunk_index: u64) -> u64 {
        let offset = self.chunk_offset(chunk_index);
        self.file_size
            .saturating_sub(offset)
            .min(self.chunk_size as u64)
    }
}
