use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use airshare_protocol::{ChunkStatus, TransferStatus};

use crate::TransferError;

/// One fixed-size slice of a file. Payload bytes are never held here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    /// Size in bytes; only the last chunk may be shorter than the chunk size.
    pub size: u64,
    /// SHA-256 hex of the chunk bytes (empty until read or received).
    pub checksum: String,
    pub status: ChunkStatus,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn new(index: usize, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            checksum: String::new(),
            status: ChunkStatus::Pending,
            retries: 0,
            last_error: None,
        }
    }

    fn transition(&mut self, allowed: &[ChunkStatus], to: ChunkStatus) -> Result<(), TransferError> {
        if !allowed.contains(&self.status) {
            return Err(TransferError::InvalidTransition {
                entity: "chunk",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_sending(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Pending], ChunkStatus::Sending)
    }

    pub fn mark_sent(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Sending], ChunkStatus::Sent)?;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_received(&mut self, checksum: String) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Pending], ChunkStatus::Received)?;
        self.checksum = checksum;
        Ok(())
    }

    pub fn mark_verified(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Received], ChunkStatus::Verified)
    }

    /// Records a failed attempt. Allowed from any non-terminal state.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransferError> {
        self.transition(
            &[
                ChunkStatus::Pending,
                ChunkStatus::Sending,
                ChunkStatus::Received,
                ChunkStatus::Failed,
            ],
            ChunkStatus::Failed,
        )?;
        self.retries += 1;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Puts a failed chunk back in the queue.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Pending, ChunkStatus::Failed], ChunkStatus::Pending)
    }
}

/// Splits `size` bytes into chunk descriptors of at most `chunk_size` bytes.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<Chunk> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let count = size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            Chunk::new(i as usize, offset, chunk_size.min(size - offset))
        })
        .collect()
}

/// A single file transfer, tracked on both the sending and receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub id: String,
    pub file_name: String,
    pub declared_size: u64,
    /// SHA-256 hex of the whole file; empty when the sender did not declare one.
    pub expected_hash: String,
    pub chunk_size: u64,
    pub chunks: Vec<Chunk>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferSession {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        declared_size: u64,
        chunk_size: u64,
        expected_hash: impl Into<String>,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidParameter(
                "chunk size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            id: id.into(),
            file_name: file_name.into(),
            declared_size,
            expected_hash: expected_hash.into(),
            chunk_size,
            chunks: plan_chunks(declared_size, chunk_size),
            status: TransferStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if the session is pending or in-progress.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    fn invalid(&self, to: TransferStatus) -> TransferError {
        TransferError::InvalidTransition {
            entity: "session",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Moves a pending session to in-progress. Idempotent while in progress.
    pub fn start(&mut self) -> Result<(), TransferError> {
        match self.status {
            TransferStatus::Pending => {
                self.status = TransferStatus::InProgress;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            TransferStatus::InProgress => Ok(()),
            _ => Err(self.invalid(TransferStatus::InProgress)),
        }
    }

    /// Marks the session completed. Every chunk must have been transferred.
    pub fn complete(&mut self) -> Result<(), TransferError> {
        if self.status != TransferStatus::InProgress {
            return Err(self.invalid(TransferStatus::Completed));
        }
        let missing: Vec<usize> = self
            .chunks
            .iter()
            .filter(|c| !c.status.is_transferred())
            .map(|c| c.index)
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::MissingChunks(missing));
        }
        self.status = TransferStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the session failed, retaining the error for later inspection.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransferError> {
        if self.status != TransferStatus::InProgress {
            return Err(self.invalid(TransferStatus::Failed));
        }
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        if self.status.is_terminal() {
            return Err(self.invalid(TransferStatus::Cancelled));
        }
        self.status = TransferStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}
