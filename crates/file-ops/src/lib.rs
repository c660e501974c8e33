//! Operations on the storage directory behind the file endpoints.
//!
//! Every name handed in by a client is a bare file name resolved against the
//! storage directory; anything that could escape it is rejected.

mod range;
mod storage;

pub use range::{ByteRange, DownloadPlan, parse_range, plan_download, read_range};
pub use storage::{delete_file, list_files, rename_file, resolve};

/// Errors produced by file operations.
#[derive(Debug, thiserror::Error)]
pub enum FileOpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },
}

impl FileOpsError {
    /// HTTP status a handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FileOpsError::Io(_) => 500,
            FileOpsError::InvalidName(_) => 400,
            FileOpsError::NotFound(_) => 404,
            FileOpsError::AlreadyExists(_) => 409,
            FileOpsError::RangeNotSatisfiable { .. } => 416,
        }
    }
}
