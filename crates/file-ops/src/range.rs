//! `Range` header handling for downloads.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::FileOpsError;
use crate::storage::resolve;

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; a range always covers at least one byte.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for this range of a `total`-byte file.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// Parses a `Range` header against a file of `size` bytes.
///
/// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`; an end past
/// the file is clamped. Headers that are not a single byte range are ignored
/// (`Ok(None)`), which means the whole file is served. Ranges that fall
/// outside the file fail with `RangeNotSatisfiable`.
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>, FileOpsError> {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if ranges.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = ranges.trim().split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());
    let unsatisfiable = FileOpsError::RangeNotSatisfiable { size };

    let range = match (start.is_empty(), end.is_empty()) {
        (true, true) => return Ok(None),
        (true, false) => {
            let Ok(suffix) = end.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(unsatisfiable);
            }
            ByteRange {
                start: size.saturating_sub(suffix),
                end: size - 1,
            }
        }
        (false, open_end) => {
            let Ok(start) = start.parse::<u64>() else {
                return Ok(None);
            };
            let end = if open_end {
                u64::MAX
            } else {
                match end.parse::<u64>() {
                    Ok(end) => end,
                    Err(_) => return Ok(None),
                }
            };
            if end < start {
                return Ok(None);
            }
            if start >= size {
                return Err(unsatisfiable);
            }
            ByteRange {
                start,
                end: end.min(size - 1),
            }
        }
    };
    Ok(Some(range))
}

/// How a download request should be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPlan {
    /// `200` with the whole file.
    Full { length: u64 },
    /// `206` with one range.
    Partial { range: ByteRange, total: u64 },
    /// `416`; nothing is sent.
    Unsatisfiable { total: u64 },
}

impl DownloadPlan {
    pub fn status(&self) -> u16 {
        match self {
            DownloadPlan::Full { .. } => 200,
            DownloadPlan::Partial { .. } => 206,
            DownloadPlan::Unsatisfiable { .. } => 416,
        }
    }

    /// Response headers beyond `Content-Type`.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            DownloadPlan::Full { length } => vec![
                ("Accept-Ranges", "bytes".to_string()),
                ("Content-Length", length.to_string()),
            ],
            DownloadPlan::Partial { range, total } => vec![
                ("Accept-Ranges", "bytes".to_string()),
                ("Content-Range", range.content_range(*total)),
                ("Content-Length", range.length().to_string()),
            ],
            DownloadPlan::Unsatisfiable { total } => {
                vec![("Content-Range", format!("bytes */{total}"))]
            }
        }
    }

    /// The range to read, if any bytes are to be sent.
    pub fn range(&self) -> Option<ByteRange> {
        match self {
            DownloadPlan::Full { length: 0 } | DownloadPlan::Unsatisfiable { .. } => None,
            DownloadPlan::Full { length } => Some(ByteRange {
                start: 0,
                end: length - 1,
            }),
            DownloadPlan::Partial { range, .. } => Some(*range),
        }
    }
}

/// Resolves `name` and decides how to answer a download of it.
pub fn plan_download(
    storage: &Path,
    name: &str,
    range_header: Option<&str>,
) -> Result<(PathBuf, DownloadPlan), FileOpsError> {
    let path = resolve(storage, name)?;
    let metadata = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(FileOpsError::NotFound(name.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FileOpsError::NotFound(name.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let total = metadata.len();

    let plan = match range_header.map(|h| parse_range(h, total)).transpose() {
        Ok(Some(Some(range))) => DownloadPlan::Partial { range, total },
        Ok(_) => DownloadPlan::Full { length: total },
        Err(FileOpsError::RangeNotSatisfiable { .. }) => DownloadPlan::Unsatisfiable { total },
        Err(e) => return Err(e),
    };
    tracing::debug!(file = %name, status = plan.status(), "planned download");
    Ok((path, plan))
}

/// Reads the bytes of `range` from `path`.
pub async fn read_range(path: &Path, range: ByteRange) -> Result<Vec<u8>, FileOpsError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = Vec::with_capacity(range.length() as usize);
    file.take(range.length()).read_to_end(&mut buf).await?;
    Ok(buf)
}
