//! Chunked send loop
//!
//! Reads a file sequentially in `chunk_size` pieces and hands each one to a
//! caller-supplied sender. The final chunk may be shorter than `chunk_size`.

use crate::network::message::FileChunk;
use crate::transfer::metadata::FileMetadata;
use crate::transfer::store::TransferError;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fill `buf` from `reader`, stopping early only at end of stream
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream a file as `file_chunk` payloads.
///
/// Returns the number of chunks sent. Read and send failures end the
/// stream and are returned to the caller.
pub async fn stream_file<R, F, Fut>(
    mut reader: R,
    metadata: &FileMetadata,
    mut send: F,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    F: FnMut(FileChunk) -> Fut,
    Fut: Future<Output = Result<(), TransferError>>,
{
    if metadata.chunk_size == 0 {
        return Err(TransferError::InvalidMetadata(format!(
            "zero chunk size for {}",
            metadata.file_id
        )));
    }

    let mut buf = vec![0u8; metadata.chunk_size as usize];
    let mut chunk_index = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }

        send(FileChunk {
            file_id: metadata.file_id.clone(),
            chunk_index,
            chunk_data: buf[..n].to_vec(),
        })
        .await?;
        chunk_index += 1;

        if n < buf.len() {
            break;
        }
    }

    log::debug!("Streamed {} chunks of {}", chunk_index, metadata.file_id);
    Ok(chunk_index)
}
