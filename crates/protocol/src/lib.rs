//! Wire protocol shared by AirShare peers.
//!
//! Discovery constants, the multicast heartbeat beacon, and the JSON bodies
//! of the HTTP file API live here so every crate speaks the same shapes.

pub mod api;
pub mod constants;
pub mod types;

// Re-export primary types for convenience.
pub use api::{
    ChunkQuery, DeviceListResponse, ErrorResponse, FileEntry, FileListResponse, FinishUploadRequest,
    InitUploadRequest, OkResponse, RenameRequest, StatusResponse, UploadStateResponse,
};
pub use types::{Beacon, ChunkStatus, DeviceType, TransferStatus};
