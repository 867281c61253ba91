//! On-disk file storage for transfers
//!
//! Each file lives at `<data_dir>/<file_id>` with a JSON sidecar at
//! `<data_dir>/<file_id>.metadata`. Chunk writes are positional, so chunks
//! may arrive in any order and may be written more than once.

use crate::transfer::metadata::{FileMetadata, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Sidecar extension for metadata records
const METADATA_EXT: &str = "metadata";

/// Longest accepted file id
const MAX_FILE_ID_LEN: usize = 128;

/// Buffer size used while ingesting files
const INGEST_BUFFER_SIZE: usize = 64 * 1024;

/// File transfer storage errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid file id: {0:?}")]
    InvalidFileId(String),
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("Chunk {chunk_index} of {file_id} is out of range")]
    ChunkOutOfRange { file_id: String, chunk_index: u64 },
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Check that a file id is safe to use as a file name inside the data directory
pub fn validate_file_id(file_id: &str) -> Result<(), TransferError> {
    let valid = !file_id.is_empty()
        && file_id.len() <= MAX_FILE_ID_LEN
        && !file_id.starts_with('.')
        && !file_id.ends_with(&format!(".{}", METADATA_EXT))
        && file_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(TransferError::InvalidFileId(file_id.to_string()))
    }
}

/// Derive a fresh file id from the name, the content digest and random salt
fn derive_file_id(filename: &str, content_digest: &[u8]) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(content_digest);
    hasher.update(salt);
    hex::encode(&hasher.finalize()[..16])
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_chunk_size(chunk_size: u32, file_id: &str) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidMetadata(format!(
            "zero chunk size for {}",
            file_id
        )));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidMetadata(format!(
            "chunk size {} for {} exceeds {}",
            chunk_size, file_id, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}

/// File storage manager
pub struct FileStore {
    data_dir: PathBuf,
    chunk_size: u32,
    /// Per-file write locks, so writes to one file never block another.
    /// An entry lives only while someone holds or waits on it.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        Self::with_chunk_size(data_dir, DEFAULT_CHUNK_SIZE)
    }

    /// Open a store that registers new files with a custom chunk size
    pub fn with_chunk_size(
        data_dir: impl Into<PathBuf>,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        let data_dir = data_dir.into();
        check_chunk_size(chunk_size, "new files")?;
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            chunk_size,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Path of a stored file
    pub fn file_path(&self, file_id: &str) -> Result<PathBuf, TransferError> {
        validate_file_id(file_id)?;
        Ok(self.data_dir.join(file_id))
    }

    fn metadata_path(&self, file_id: &str) -> Result<PathBuf, TransferError> {
        validate_file_id(file_id)?;
        Ok(self
            .data_dir
            .join(format!("{}.{}", file_id, METADATA_EXT)))
    }

    /// Run `write` while holding the write lock for `file_id`
    fn with_write_lock<T>(
        &self,
        file_id: &str,
        write: impl FnOnce() -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let file_lock = lock(&self.write_locks)
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock(&file_lock);
            write()
        };

        // Clones are only handed out under the table lock, so a count of two
        // (table + ours) means nobody else holds or waits on this entry
        let mut locks = lock(&self.write_locks);
        if Arc::strong_count(&file_lock) == 2
            && locks
                .get(file_id)
                .is_some_and(|current| Arc::ptr_eq(current, &file_lock))
        {
            locks.remove(file_id);
        }

        result
    }

    /// Persist a metadata record, replacing any previous one for the same id
    pub fn store_metadata(&self, metadata: &FileMetadata) -> Result<(), TransferError> {
        check_chunk_size(metadata.chunk_size, &metadata.file_id)?;
        let path = self.metadata_path(&metadata.file_id)?;

        self.with_write_lock(&metadata.file_id, || {
            // Write to temporary file first
            let temp_path = path.with_extension("metadata.tmp");
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, metadata)?;
            writer.flush()?;
            drop(writer);

            // Atomic rename
            fs::rename(&temp_path, &path)?;

            // No chunk will ever arrive for an empty file
            if metadata.file_size == 0 {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.file_path(&metadata.file_id)?)?;
            }
            Ok(())
        })
    }

    /// Load a metadata record by file id
    pub fn get_metadata(&self, file_id: &str) -> Result<FileMetadata, TransferError> {
        let path = self.metadata_path(file_id)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(file_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = serde_json::from_reader(BufReader::new(file))?;
        Ok(metadata)
    }

    /// All metadata records in the store, ordered by file id
    pub fn list_metadata(&self) -> Result<Vec<FileMetadata>, TransferError> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            let Some(file_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.get_metadata(file_id) {
                Ok(metadata) => records.push(metadata),
                Err(e) => log::warn!("Skipping unreadable metadata {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(records)
    }

    /// Find a stored file by its original filename
    pub fn find_by_name(&self, filename: &str) -> Result<Option<FileMetadata>, TransferError> {
        Ok(self
            .list_metadata()?
            .into_iter()
            .find(|metadata| metadata.filename == filename))
    }

    /// Resolve a file id or filename, trying the id first
    pub fn resolve(&self, name_or_id: &str) -> Result<FileMetadata, TransferError> {
        if validate_file_id(name_or_id).is_ok() {
            match self.get_metadata(name_or_id) {
                Ok(metadata) => return Ok(metadata),
                Err(TransferError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.find_by_name(name_or_id)?
            .ok_or_else(|| TransferError::NotFound(name_or_id.to_string()))
    }

    /// Open a stored file for reading
    pub fn open_for_read(&self, file_id: &str) -> Result<File, TransferError> {
        let path = self.file_path(file_id)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::NotFound(file_id.to_string()),
            _ => e.into(),
        })
    }

    /// Create (or truncate) a stored file for writing
    pub fn create_for_write(&self, file_id: &str) -> Result<File, TransferError> {
        let path = self.file_path(file_id)?;
        Ok(File::create(path)?)
    }

    /// Write a chunk at `chunk_index * data.len()`
    pub fn write_chunk(
        &self,
        file_id: &str,
        chunk_index: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        self.write_chunk_at(file_id, chunk_index, data.len() as u64, data)
    }

    /// Write a chunk at `chunk_index * chunk_size`, creating the file if absent
    pub fn write_chunk_at(
        &self,
        file_id: &str,
        chunk_index: u64,
        chunk_size: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let path = self.file_path(file_id)?;
        let offset = chunk_index
            .checked_mul(chunk_size)
            .ok_or_else(|| TransferError::ChunkOutOfRange {
                file_id: file_id.to_string(),
                chunk_index,
            })?;

        self.with_write_lock(file_id, || {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            Ok(())
        })
    }

    /// Write a chunk received from a peer.
    ///
    /// With metadata on record the chunk must be one of the file's chunks and
    /// exactly as long as that chunk, so it lands inside `file_size`. Without
    /// metadata it is written at `chunk_index * data.len()`.
    pub fn write_received_chunk(
        &self,
        file_id: &str,
        chunk_index: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let metadata = match self.get_metadata(file_id) {
            Ok(metadata) => metadata,
            Err(TransferError::NotFound(_)) => return self.write_chunk(file_id, chunk_index, data),
            Err(e) => return Err(e),
        };

        if chunk_index >= metadata.chunk_count()
            || data.len() as u64 != metadata.chunk_len(chunk_index)
        {
            return Err(TransferError::ChunkOutOfRange {
                file_id: file_id.to_string(),
                chunk_index,
            });
        }
        self.write_chunk_at(file_id, chunk_index, metadata.chunk_size as u64, data)
    }

    /// Whether the local copy has every byte the metadata promises
    pub fn is_complete(&self, file_id: &str) -> Result<bool, TransferError> {
        let metadata = self.get_metadata(file_id)?;
        match fs::metadata(self.file_path(file_id)?) {
            Ok(stat) => Ok(stat.len() == metadata.file_size),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ingest a file into storage and write its metadata.
    ///
    /// Nothing is left behind in the data directory if any step fails.
    pub fn register_file<R: Read>(
        &self,
        filename: &str,
        mut source: R,
    ) -> Result<FileMetadata, TransferError> {
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);
        // Leading dot keeps staging names out of the valid id space
        let staging = self.data_dir.join(format!(".ingest-{}", hex::encode(salt)));

        let (file_size, digest) = match Self::copy_hashed(&mut source, &staging) {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };

        let metadata = FileMetadata {
            file_id: derive_file_id(filename, &digest),
            filename: filename.to_string(),
            file_size,
            chunk_size: self.chunk_size,
        };

        let path = self.file_path(&metadata.file_id)?;
        if let Err(e) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        if let Err(e) = self.store_metadata(&metadata) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        log::info!(
            "Registered {} as {} ({} bytes, {} chunks)",
            metadata.filename,
            metadata.file_id,
            metadata.file_size,
            metadata.chunk_count()
        );
        Ok(metadata)
    }

    /// Ingest a file from the local filesystem under its base name
    pub fn register_path(&self, path: &Path) -> Result<FileMetadata, TransferError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TransferError::InvalidMetadata(format!("no file name in {:?}", path)))?
            .to_string();
        let file = File::open(path)?;
        self.register_file(&filename, BufReader::new(file))
    }

    fn copy_hashed<R: Read>(source: &mut R, dest: &Path) -> Result<(u64, Vec<u8>), TransferError> {
        let mut writer = BufWriter::new(File::create(dest)?);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; INGEST_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n])?;
            total += n as u64;
        }

        writer.flush()?;
        Ok((total, hasher.finalize().to_vec()))
    }
}
