use serde::{Deserialize, Serialize};

use crate::types::DeviceType;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a receive session. Only `id` is required; the remaining fields form
/// the optional manifest used to verify chunks and the assembled file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<String>,
}

/// Query string of `upload/chunk` and `upload/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub id: String,
    #[serde(default)]
    pub index: Option<usize>,
}

/// Assembles a finished upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishUploadRequest {
    pub id: String,
    pub name: String,
    pub total: usize,
}

/// Renames a stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Body of `GET /api/status`, the endpoint subnet scans probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub version: String,
}

/// Chunk indices already stored for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStateResponse {
    pub chunks: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<FileEntry>,
}

/// Device list returned by `GET /api/devices`; generic so the discovery
/// crate's device record can be carried without a protocol dependency cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListResponse<D> {
    pub devices: Vec<D>,
}
