use std::io::{Read, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use airshare_protocol::{ChunkStatus, InitUploadRequest};

use crate::types::{Chunk, TransferSession};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reads into `buf` until it is full or the reader hits EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
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

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Snapshot of how far a session has come, derived from chunk statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl Progress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.completed_chunks == self.total_chunks { 100.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// ChunkEngine
// ---------------------------------------------------------------------------

/// Sender side of a transfer: plans a file into chunks and reads them back.
#[derive(Debug, Clone)]
pub struct ChunkEngine {
    chunk_size: u64,
    max_retries: u32,
}

impl Default for ChunkEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES)
    }
}

impl ChunkEngine {
    /// Creates an engine. A `chunk_size` of 0 falls back to [`DEFAULT_CHUNK_SIZE`],
    /// a `max_retries` of 0 to [`DEFAULT_MAX_RETRIES`].
    pub fn new(chunk_size: u64, max_retries: u32) -> Self {
        Self {
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            max_retries: if max_retries == 0 { DEFAULT_MAX_RETRIES } else { max_retries },
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Hashes `path` and splits it into pending chunks in a single pass.
    pub async fn prepare(&self, path: &Path) -> Result<TransferSession, TransferError> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut session = TransferSession::new(
            uuid::Uuid::new_v4().to_string(),
            file_name,
            size,
            self.chunk_size,
            String::new(),
        )?;

        let mut whole = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size as usize];
        for chunk in &mut session.chunks {
            let want = chunk.size as usize;
            let n = read_full(&mut file, &mut buf[..want]).await?;
            if n < want {
                return Err(TransferError::ShortRead {
                    index: chunk.index,
                    expected: chunk.size,
                    actual: n as u64,
                });
            }
            whole.update(&buf[..n]);
            chunk.checksum = checksum_bytes(&buf[..n]);
        }
        session.expected_hash = hex::encode(whole.finalize());

        tracing::debug!(
            session = %session.id,
            file = %session.file_name,
            size,
            chunks = session.total_chunks(),
            "prepared transfer"
        );
        Ok(session)
    }

    /// Reads the bytes of `chunk` from `path`.
    ///
    /// Stores the checksum on first read; a later read whose bytes no longer
    /// match means the file changed underneath the session.
    pub async fn read_chunk(&self, path: &Path, chunk: &mut Chunk) -> Result<Vec<u8>, TransferError> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;

        let mut buf = vec![0u8; chunk.size as usize];
        let n = read_full(&mut file, &mut buf).await?;
        if (n as u64) < chunk.size {
            return Err(TransferError::ShortRead {
                index: chunk.index,
                expected: chunk.size,
                actual: n as u64,
            });
        }

        let actual = checksum_bytes(&buf);
        if chunk.checksum.is_empty() {
            chunk.checksum = actual;
        } else if chunk.checksum != actual {
            return Err(TransferError::ChecksumMismatch {
                index: chunk.index,
                expected: chunk.checksum.clone(),
                actual,
            });
        }
        Ok(buf)
    }

    /// Metadata a receiver needs to verify the transfer.
    pub fn manifest(&self, session: &TransferSession) -> InitUploadRequest {
        InitUploadRequest {
            id: session.id.clone(),
            name: session.file_name.clone(),
            size: Some(session.declared_size),
            chunk_size: Some(session.chunk_size),
            hash: session.expected_hash.clone(),
            checksums: session.chunks.iter().map(|c| c.checksum.clone()).collect(),
        }
    }

    /// Requeues every pending or failed chunk that still has retries left and
    /// returns their indices. Moves the session to in-progress.
    pub fn resume(&self, session: &mut TransferSession) -> Result<Vec<usize>, TransferError> {
        session.start()?;
        let mut queued = Vec::new();
        for chunk in &mut session.chunks {
            let retriable = matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Failed);
            if retriable && chunk.retries < self.max_retries {
                chunk.reset()?;
                queued.push(chunk.index);
            }
        }
        Ok(queued)
    }

    /// Records a failed attempt on `chunk`. Returns `RetriesExhausted` once the
    /// chunk has used up its attempts.
    pub fn mark_chunk_failed(&self, chunk: &mut Chunk, error: &str) -> Result<(), TransferError> {
        chunk.mark_failed(error)?;
        if chunk.retries >= self.max_retries {
            return Err(TransferError::RetriesExhausted {
                index: chunk.index,
                retries: chunk.retries,
                last_error: error.to_string(),
            });
        }
        Ok(())
    }

    pub fn progress(&self, session: &TransferSession) -> Progress {
        let (completed_chunks, bytes_transferred) = session
            .chunks
            .iter()
            .filter(|c| c.status.is_transferred())
            .fold((0, 0), |(n, bytes), c| (n + 1, bytes + c.size));
        Progress {
            completed_chunks,
            total_chunks: session.total_chunks(),
            bytes_transferred,
            total_bytes: session.declared_size,
        }
    }
}
