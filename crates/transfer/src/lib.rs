//! Chunked file transfer with resume support and integrity verification.
//!
//! The sender side ([`ChunkEngine`]) plans a file into fixed-size chunks and
//! reads them on demand; the receiver side ([`Receiver`]) accepts chunks in
//! any order and reassembles a verified file. [`Uploader`] drives a session
//! against any [`ChunkSink`] with bounded, backed-off retries.

mod chunked;
mod receiver;
mod types;
mod uploader;
mod validation;

pub use airshare_protocol::constants::DEFAULT_CHUNK_SIZE;
pub use chunked::{ChunkEngine, Progress, calculate_file_checksum, checksum_bytes};
pub use receiver::{FinishedTransfer, Manifest, Receiver, ReceiverConfig};
pub use types::{Chunk, TransferSession, plan_chunks};
pub use uploader::{ChunkSink, RetryPolicy, SinkFuture, UploadEvent, Uploader};
pub use validation::validate_file_name;

/// Default number of attempts a chunk gets before the transfer fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("short read on chunk {index}: expected {expected} bytes, got {actual}")]
    ShortRead {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch on chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("file hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("session not active: {0}")]
    SessionNotActive(String),

    #[error("missing chunks: {0:?}")]
    MissingChunks(Vec<usize>),

    #[error("chunk {index} failed {retries} times: {last_error}")]
    RetriesExhausted {
        index: usize,
        retries: u32,
        last_error: String,
    },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("transport error: {0}")]
    Sink(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Errors a retry cannot fix; the session must be restarted instead.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidParameter(_)
                | TransferError::InvalidPath(_)
                | TransferError::ShortRead { .. }
                | TransferError::IntegrityMismatch { .. }
                | TransferError::SessionNotFound(_)
                | TransferError::SessionNotActive(_)
                | TransferError::InvalidTransition { .. }
                | TransferError::Cancelled
        )
    }
}
