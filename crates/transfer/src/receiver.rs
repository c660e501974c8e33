use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use airshare_protocol::constants::{CHUNK_DIR, DEFAULT_MAX_FILE_SIZE};
use airshare_protocol::{ChunkStatus, InitUploadRequest, TransferStatus};

use crate::chunked::checksum_bytes;
use crate::types::{Chunk, TransferSession};
use crate::validation::validate_file_name;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Upper bound on chunk indices for sessions that declared no size.
const MAX_UNPLANNED_CHUNKS: usize = 1 << 16;

/// Where received files land and how large they may be.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub storage_dir: PathBuf,
    pub max_file_size: u64,
    /// Delete chunk data left by earlier runs when opening. Must be off when
    /// another receiver is live on the same storage directory.
    pub purge_stale: bool,
}

impl ReceiverConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            purge_stale: true,
        }
    }
}

/// Optional description of the incoming file, sent with session init.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub size: Option<u64>,
    pub chunk_size: Option<u64>,
    /// Whole-file SHA-256 hex; empty skips the final hash check.
    pub hash: String,
    /// Per-chunk SHA-256 hex, either empty or one per chunk.
    pub checksums: Vec<String>,
}

impl Manifest {
    /// Validates the manifest fields of an init request.
    pub fn from_request(req: &InitUploadRequest) -> Result<Self, TransferError> {
        let manifest = Self {
            name: req.name.clone(),
            size: req.size,
            chunk_size: req.chunk_size,
            hash: req.hash.to_ascii_lowercase(),
            checksums: req.checksums.iter().map(|c| c.to_ascii_lowercase()).collect(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), TransferError> {
        match (self.size, self.chunk_size) {
            (Some(_), None) | (None, Some(_)) => Err(TransferError::InvalidParameter(
                "size and chunkSize must be given together".into(),
            )),
            (_, Some(0)) => Err(TransferError::InvalidParameter(
                "chunk size must be greater than zero".into(),
            )),
            (None, None) if !self.checksums.is_empty() => Err(TransferError::InvalidParameter(
                "chunk checksums require size and chunkSize".into(),
            )),
            (Some(size), Some(chunk_size)) => {
                let total = size.div_ceil(chunk_size) as usize;
                if !self.checksums.is_empty() && self.checksums.len() != total {
                    return Err(TransferError::InvalidParameter(format!(
                        "expected {total} chunk checksums, got {}",
                        self.checksums.len()
                    )));
                }
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    fn has_layout(&self) -> bool {
        self.size.is_some()
    }
}

/// Result of a successful [`Receiver::finish`].
#[derive(Debug, Clone)]
pub struct FinishedTransfer {
    pub path: PathBuf,
    pub session: TransferSession,
}

struct SessionState {
    session: TransferSession,
    manifest: Manifest,
    dir: PathBuf,
    /// Last time the sender touched this session.
    touched: Instant,
}

impl SessionState {
    fn ensure_active(&self) -> Result<(), TransferError> {
        match self.session.status {
            TransferStatus::Pending | TransferStatus::InProgress => Ok(()),
            // Completed and cancelled sessions are already gone from the table.
            TransferStatus::Completed | TransferStatus::Cancelled => {
                Err(TransferError::SessionNotFound(self.session.id.clone()))
            }
            TransferStatus::Failed => Err(TransferError::SessionNotActive(self.session.id.clone())),
        }
    }

    fn check_chunk(&mut self, index: usize, payload: &[u8], checksum: &str) -> Result<(), TransferError> {
        if !self.manifest.has_layout() {
            if index >= MAX_UNPLANNED_CHUNKS {
                return Err(TransferError::InvalidParameter(format!(
                    "chunk index {index} too large for a session without a manifest"
                )));
            }
            return Ok(());
        }
        let Some(chunk) = self.session.chunks.get_mut(index) else {
            return Err(TransferError::InvalidParameter(format!(
                "chunk index {index} out of range (total {})",
                self.session.chunks.len()
            )));
        };

        let mismatch = if payload.len() as u64 != chunk.size {
            Some((format!("{} bytes", chunk.size), format!("{} bytes", payload.len())))
        } else {
            match self.manifest.checksums.get(index) {
                Some(expected) if expected != checksum => {
                    Some((expected.clone(), checksum.to_string()))
                }
                _ => None,
            }
        };

        if let Some((expected, actual)) = mismatch {
            let err = TransferError::ChecksumMismatch {
                index,
                expected,
                actual,
            };
            if chunk.status == ChunkStatus::Pending {
                let _ = chunk.mark_failed(err.to_string());
            }
            return Err(err);
        }
        Ok(())
    }

    fn record_chunk(&mut self, index: usize, size: u64, checksum: String) -> Result<(), TransferError> {
        if !self.manifest.has_layout() {
            let chunk_size = self.session.chunk_size;
            while self.session.chunks.len() <= index {
                let i = self.session.chunks.len();
                self.session.chunks.push(Chunk::new(i, i as u64 * chunk_size, 0));
            }
            self.session.chunks[index].size = size;
        }
        self.session.start()?;

        let chunk = &mut self.session.chunks[index];
        match chunk.status {
            // Resent chunk; the new payload replaced the stored one.
            ChunkStatus::Received => chunk.checksum = checksum,
            ChunkStatus::Failed => {
                chunk.reset()?;
                chunk.mark_received(checksum)?;
            }
            _ => chunk.mark_received(checksum)?,
        }
        Ok(())
    }

    fn received_indices(&self) -> Vec<usize> {
        self.session
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Received)
            .map(|c| c.index)
            .collect()
    }

    /// Fixes the chunk count of a session that was started without a layout.
    fn settle_layout(&mut self, total: usize) -> Result<(), TransferError> {
        if self.manifest.has_layout() {
            if total != self.session.total_chunks() {
                return Err(TransferError::InvalidParameter(format!(
                    "total {total} does not match declared chunk count {}",
                    self.session.total_chunks()
                )));
            }
            return Ok(());
        }

        if self.session.chunks.len() > total {
            return Err(TransferError::InvalidParameter(format!(
                "received chunk {} beyond total {total}",
                self.session.chunks.len() - 1
            )));
        }
        let missing = (self.session.chunks.len()..total).chain(
            self.session
                .chunks
                .iter()
                .filter(|c| c.status != ChunkStatus::Received)
                .map(|c| c.index),
        );
        let mut missing: Vec<usize> = missing.collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(TransferError::MissingChunks(missing));
        }

        let mut offset = 0;
        for chunk in &mut self.session.chunks {
            chunk.offset = offset;
            offset += chunk.size;
        }
        self.session.declared_size = offset;
        Ok(())
    }
}

type SessionHandle = Arc<tokio::sync::Mutex<SessionState>>;

struct Inner {
    config: ReceiverConfig,
    chunks_root: PathBuf,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    tmp_counter: AtomicU64,
}

/// Receiving side of chunked transfers.
///
/// Owns the session table and the on-disk chunk store under
/// `{storage}/.chunks/{session}/`. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

impl Receiver {
    /// Opens the storage directory, creating it if needed. With
    /// [`ReceiverConfig::purge_stale`] set, chunk payloads left behind by a
    /// previous run are deleted.
    pub async fn open(config: ReceiverConfig) -> Result<Self, TransferError> {
        let chunks_root = config.storage_dir.join(CHUNK_DIR);
        tokio::fs::create_dir_all(&chunks_root).await?;
        if config.purge_stale {
            purge(&chunks_root).await?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                chunks_root,
                sessions: Mutex::new(HashMap::new()),
                tmp_counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.config.storage_dir
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, id: &str) -> Result<SessionHandle, TransferError> {
        self.sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotFound(id.to_string()))
    }

    /// Whether `handle` is still the table entry for `id`; finish, cancel and
    /// re-init may have replaced or removed it.
    fn is_current(&self, id: &str, handle: &SessionHandle) -> bool {
        self.sessions().get(id).is_some_and(|h| Arc::ptr_eq(h, handle))
    }

    fn forget(&self, id: &str) {
        self.sessions().remove(id);
    }

    /// Starts a new session. A terminal session retained under the same ID
    /// is replaced; a live one is not.
    pub async fn init_session(&self, id: &str, manifest: Option<Manifest>) -> Result<(), TransferError> {
        if id.is_empty() {
            return Err(TransferError::InvalidParameter("session id is empty".into()));
        }
        validate_file_name(id)
            .map_err(|_| TransferError::InvalidParameter(format!("invalid session id: {id}")))?;

        let manifest = manifest.unwrap_or_default();
        manifest.validate()?;
        if let Some(size) = manifest.size
            && size > self.inner.config.max_file_size
        {
            return Err(TransferError::InvalidParameter(format!(
                "file size {size} exceeds limit {}",
                self.inner.config.max_file_size
            )));
        }

        let session = match (manifest.size, manifest.chunk_size) {
            (Some(size), Some(chunk_size)) => {
                TransferSession::new(id, manifest.name.clone(), size, chunk_size, manifest.hash.clone())?
            }
            _ => TransferSession::new(id, manifest.name.clone(), 0, DEFAULT_CHUNK_SIZE, manifest.hash.clone())?,
        };
        let dir = self.inner.chunks_root.join(id);

        {
            let mut sessions = self.sessions();
            if let Some(existing) = sessions.get(id) {
                let live = existing
                    .try_lock()
                    .map(|state| state.session.is_active())
                    .unwrap_or(true);
                if live {
                    return Err(TransferError::SessionExists(id.to_string()));
                }
            }
            sessions.insert(
                id.to_string(),
                Arc::new(tokio::sync::Mutex::new(SessionState {
                    session,
                    manifest,
                    dir: dir.clone(),
                    touched: Instant::now(),
                })),
            );
        }

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.forget(id);
            return Err(e.into());
        }
        tracing::debug!(session = %id, "transfer session initialised");
        Ok(())
    }

    /// Convenience wrapper taking the wire form of an init request.
    pub async fn init_from_request(&self, req: &InitUploadRequest) -> Result<(), TransferError> {
        let manifest = Manifest::from_request(req)?;
        self.init_session(&req.id, Some(manifest)).await
    }

    /// Stores one chunk. Chunks may arrive in any order and concurrently.
    pub async fn write_chunk(&self, id: &str, index: usize, payload: &[u8]) -> Result<(), TransferError> {
        if payload.len() as u64 > self.inner.config.max_file_size {
            return Err(TransferError::InvalidParameter(format!(
                "chunk of {} bytes exceeds file size limit",
                payload.len()
            )));
        }
        let handle = self.handle(id)?;
        let checksum = checksum_bytes(payload);

        let dir = {
            let mut state = handle.lock().await;
            state.ensure_active()?;
            state.check_chunk(index, payload, &checksum)?;
            state.dir.clone()
        };

        let n = self.inner.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{index}.{n}.tmp"));
        let dest = dir.join(index.to_string());
        let written = async {
            tokio::fs::write(&tmp, payload).await?;
            tokio::fs::rename(&tmp, &dest).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let mut state = handle.lock().await;
        state.ensure_active()?;
        state.record_chunk(index, payload.len() as u64, checksum)?;
        state.touched = Instant::now();
        tracing::trace!(session = %id, index, bytes = payload.len(), "chunk stored");
        Ok(())
    }

    /// Indices already stored for `id`, ascending.
    pub async fn received_indices(&self, id: &str) -> Result<Vec<usize>, TransferError> {
        let handle = self.handle(id)?;
        let state = handle.lock().await;
        Ok(state.received_indices())
    }

    /// Reassembles and verifies the file, then moves it to `{storage}/{file_name}`.
    ///
    /// The whole-file hash is only compared when the manifest declared one;
    /// a session initialised without a hash completes on chunk presence alone.
    pub async fn finish(&self, id: &str, file_name: &str, total: usize) -> Result<FinishedTransfer, TransferError> {
        validate_file_name(file_name)?;
        let handle = self.handle(id)?;
        let mut state = handle.lock().await;
        state.ensure_active()?;
        state.touched = Instant::now();
        state.settle_layout(total)?;

        let missing: Vec<usize> = state
            .session
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Received)
            .map(|c| c.index)
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::MissingChunks(missing));
        }
        state.session.start()?;

        let assembled = state.dir.join(".assembled");
        let actual = match assemble(&state.dir, total, &assembled).await {
            Ok(hash) => hash,
            Err(e) => {
                let _ = tokio::fs::remove_file(&assembled).await;
                return Err(e);
            }
        };

        let expected = state.session.expected_hash.clone();
        if !expected.is_empty() && expected != actual {
            let err = TransferError::IntegrityMismatch { expected, actual };
            state.session.fail(err.to_string())?;
            release(&state.dir).await;
            tracing::warn!(session = %id, error = %err, "transfer failed verification");
            return Err(err);
        }

        let path = self.inner.config.storage_dir.join(file_name);
        tokio::fs::rename(&assembled, &path).await?;

        for chunk in &mut state.session.chunks {
            chunk.mark_verified()?;
        }
        state.session.file_name = file_name.to_string();
        state.session.complete()?;
        release(&state.dir).await;
        let session = state.session.clone();
        drop(state);
        self.forget(id);

        tracing::info!(
            session = %id,
            file = %file_name,
            bytes = session.declared_size,
            chunks = total,
            "transfer completed"
        );
        Ok(FinishedTransfer { path, session })
    }

    /// Cancels a live session and deletes everything it stored.
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        let handle = self.handle(id)?;
        let mut state = handle.lock().await;
        state.ensure_active()?;
        state.session.cancel()?;
        release(&state.dir).await;
        drop(state);
        self.forget(id);
        tracing::info!(session = %id, "transfer cancelled");
        Ok(())
    }

    /// Snapshot of a session, including failed ones kept for inspection.
    pub async fn session(&self, id: &str) -> Option<TransferSession> {
        let handle = self.handle(id).ok()?;
        let state = handle.lock().await;
        Some(state.session.clone())
    }

    /// Forgets a terminal session and returns its final state.
    pub async fn discard(&self, id: &str) -> Result<TransferSession, TransferError> {
        let handle = self.handle(id)?;
        let state = handle.lock().await;
        if state.session.is_active() {
            return Err(TransferError::InvalidParameter(format!(
                "session {id} is still active"
            )));
        }
        let session = state.session.clone();
        drop(state);
        self.forget(id);
        Ok(session)
    }

    /// Drops failed sessions and cancels live ones that have not been touched
    /// for `idle`, deleting their chunk data. Returns how many were removed.
    pub async fn reap(&self, idle: Duration) -> usize {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();

        let mut reaped = 0;
        for (id, handle) in handles {
            let mut state = handle.lock().await;
            if state.touched.elapsed() < idle || !self.is_current(&id, &handle) {
                continue;
            }
            if state.session.is_active() {
                if let Err(e) = state.session.cancel() {
                    tracing::warn!(session = %id, error = %e, "failed to cancel idle session");
                    continue;
                }
                tracing::info!(session = %id, "idle transfer cancelled");
            } else {
                tracing::debug!(session = %id, status = %state.session.status, "dropping finished session");
            }
            release(&state.dir).await;
            drop(state);
            if self.is_current(&id, &handle) {
                self.forget(&id);
            }
            reaped += 1;
        }
        reaped
    }

    /// Snapshots of every session still accepting chunks.
    pub async fn active_sessions(&self) -> Vec<TransferSession> {
        let handles: Vec<SessionHandle> = self.sessions().values().cloned().collect();
        let mut active = Vec::new();
        for handle in handles {
            let state = handle.lock().await;
            if state.session.is_active() {
                active.push(state.session.clone());
            }
        }
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }
}

/// Concatenates chunk files `0..total` into `out`, returning the SHA-256 hex.
async fn assemble(dir: &Path, total: usize, out: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::create(out).await?;
    let mut hasher = Sha256::new();
    for index in 0..total {
        let bytes = tokio::fs::read(dir.join(index.to_string())).await?;
        hasher.update(&bytes);
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(hex::encode(hasher.finalize()))
}

async fn purge(chunks_root: &Path) -> Result<(), TransferError> {
    let mut entries = tokio::fs::read_dir(chunks_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale chunk data"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove stale chunk data"),
        }
    }
    Ok(())
}

async fn release(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to release chunk store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::{ChunkEngine, calculate_file_checksum};
    use tempfile::TempDir;

    const KIB: usize = 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn manifest_for(data: &[u8], chunk_size: usize, with_checksums: bool) -> Manifest {
        Manifest {
            name: "file.bin".into(),
            size: Some(data.len() as u64),
            chunk_size: Some(chunk_size as u64),
            hash: checksum_bytes(data),
            checksums: if with_checksums {
                data.chunks(chunk_size).map(checksum_bytes).collect()
            } else {
                Vec::new()
            },
        }
    }

    async fn open(tmp: &TempDir) -> Receiver {
        Receiver::open(ReceiverConfig::new(tmp.path())).await.unwrap()
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(150 * KIB);
        let parts: Vec<&[u8]> = data.chunks(64 * KIB).collect();
        assert_eq!(parts.len(), 3);

        receiver
            .init_session("s1", Some(manifest_for(&data, 64 * KIB, true)))
            .await
            .unwrap();
        for index in [2, 0, 1] {
            receiver.write_chunk("s1", index, parts[index]).await.unwrap();
        }
        assert_eq!(receiver.received_indices("s1").await.unwrap(), vec![0, 1, 2]);

        let done = receiver.finish("s1", "movie.bin", 3).await.unwrap();
        assert_eq!(done.path, tmp.path().join("movie.bin"));
        assert_eq!(std::fs::read(&done.path).unwrap(), data);
        assert_eq!(calculate_file_checksum(&done.path).unwrap(), checksum_bytes(&data));
        assert_eq!(done.session.status, TransferStatus::Completed);
        assert!(done.session.chunks.iter().all(|c| c.status == ChunkStatus::Verified));
        assert!(!tmp.path().join(CHUNK_DIR).join("s1").exists());

        let err = receiver.finish("s1", "movie.bin", 3).await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
        assert!(receiver.session("s1").await.is_none());
    }

    #[tokio::test]
    async fn finish_with_missing_chunks_keeps_session_open() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(10 * KIB);
        let parts: Vec<&[u8]> = data.chunks(4 * KIB).collect();

        receiver
            .init_session("s1", Some(manifest_for(&data, 4 * KIB, false)))
            .await
            .unwrap();
        receiver.write_chunk("s1", 0, parts[0]).await.unwrap();
        receiver.write_chunk("s1", 2, parts[2]).await.unwrap();

        let err = receiver.finish("s1", "f.bin", 3).await.unwrap_err();
        assert!(matches!(err, TransferError::MissingChunks(ref m) if m == &vec![1]));
        assert!(receiver.session("s1").await.unwrap().is_active());

        receiver.write_chunk("s1", 1, parts[1]).await.unwrap();
        let done = receiver.finish("s1", "f.bin", 3).await.unwrap();
        assert_eq!(std::fs::read(done.path).unwrap(), data);
    }

    #[tokio::test]
    async fn altered_chunk_fails_whole_file_check() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(8 * KIB);
        let mut altered = data[4 * KIB..].to_vec();
        altered[10] ^= 0xff;

        receiver
            .init_session("s1", Some(manifest_for(&data, 4 * KIB, false)))
            .await
            .unwrap();
        receiver.write_chunk("s1", 0, &data[..4 * KIB]).await.unwrap();
        receiver.write_chunk("s1", 1, &altered).await.unwrap();

        let err = receiver.finish("s1", "f.bin", 2).await.unwrap_err();
        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(!tmp.path().join("f.bin").exists());
        assert!(!tmp.path().join(CHUNK_DIR).join("s1").exists());

        let session = receiver.session("s1").await.unwrap();
        assert_eq!(session.status, TransferStatus::Failed);
        assert!(session.error.unwrap().contains("hash mismatch"));

        let err = receiver.write_chunk("s1", 0, &data[..4 * KIB]).await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotActive(_)));

        let discarded = receiver.discard("s1").await.unwrap();
        assert_eq!(discarded.status, TransferStatus::Failed);
        assert!(receiver.session("s1").await.is_none());
    }

    #[tokio::test]
    async fn chunk_checksum_mismatch_is_rejected_then_accepted_on_resend() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(8 * KIB);

        receiver
            .init_session("s1", Some(manifest_for(&data, 4 * KIB, true)))
            .await
            .unwrap();

        let mut corrupt = data[..4 * KIB].to_vec();
        corrupt[0] ^= 1;
        let err = receiver.write_chunk("s1", 0, &corrupt).await.unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { index: 0, .. }));
        let session = receiver.session("s1").await.unwrap();
        assert_eq!(session.chunks[0].status, ChunkStatus::Failed);

        let err = receiver.write_chunk("s1", 1, &data[..100]).await.unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { index: 1, .. }));

        receiver.write_chunk("s1", 0, &data[..4 * KIB]).await.unwrap();
        receiver.write_chunk("s1", 1, &data[4 * KIB..]).await.unwrap();
        receiver.finish("s1", "f.bin", 2).await.unwrap();
    }

    #[tokio::test]
    async fn init_validation() {
        let tmp = TempDir::new().unwrap();
        let receiver = Receiver::open(ReceiverConfig {
            storage_dir: tmp.path().to_path_buf(),
            max_file_size: 1000,
            purge_stale: true,
        })
        .await
        .unwrap();

        assert!(matches!(
            receiver.init_session("", None).await,
            Err(TransferError::InvalidParameter(_))
        ));
        assert!(matches!(
            receiver.init_session("../escape", None).await,
            Err(TransferError::InvalidParameter(_))
        ));

        let big = Manifest {
            size: Some(1001),
            chunk_size: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            receiver.init_session("big", Some(big)).await,
            Err(TransferError::InvalidParameter(_))
        ));
        assert!(receiver.session("big").await.is_none());

        receiver.init_session("s1", None).await.unwrap();
        assert!(matches!(
            receiver.init_session("s1", None).await,
            Err(TransferError::SessionExists(_))
        ));
    }

    #[test]
    fn manifest_from_request_validation() {
        let mut req = InitUploadRequest {
            id: "s".into(),
            size: Some(10),
            ..Default::default()
        };
        assert!(Manifest::from_request(&req).is_err());

        req.chunk_size = Some(4);
        req.checksums = vec!["a".into(), "b".into()];
        assert!(Manifest::from_request(&req).is_err());

        req.checksums.push("C".into());
        req.hash = "ABC".into();
        let manifest = Manifest::from_request(&req).unwrap();
        assert_eq!(manifest.hash, "abc");
        assert_eq!(manifest.checksums[2], "c");

        let bare = InitUploadRequest {
            id: "s".into(),
            ..Default::default()
        };
        assert_eq!(Manifest::from_request(&bare).unwrap(), Manifest::default());
    }

    #[tokio::test]
    async fn write_errors() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;

        assert!(matches!(
            receiver.write_chunk("ghost", 0, b"x").await,
            Err(TransferError::SessionNotFound(_))
        ));

        let data = pattern(100);
        receiver
            .init_session("s1", Some(manifest_for(&data, 50, false)))
            .await
            .unwrap();
        assert!(matches!(
            receiver.write_chunk("s1", 2, &data[..50]).await,
            Err(TransferError::InvalidParameter(_))
        ));
        assert!(matches!(
            receiver.finish("s1", "f.bin", 3).await,
            Err(TransferError::InvalidParameter(_))
        ));
        assert!(matches!(
            receiver.finish("s1", "../f.bin", 2).await,
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn cancel_removes_session_and_payloads() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        receiver.init_session("s1", None).await.unwrap();
        receiver.write_chunk("s1", 0, b"hello").await.unwrap();
        let dir = tmp.path().join(CHUNK_DIR).join("s1");
        assert!(dir.join("0").exists());

        receiver.cancel("s1").await.unwrap();
        assert!(!dir.exists());
        assert!(receiver.session("s1").await.is_none());
        assert!(matches!(
            receiver.write_chunk("s1", 1, b"x").await,
            Err(TransferError::SessionNotFound(_))
        ));
        assert!(matches!(
            receiver.cancel("s1").await,
            Err(TransferError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_without_manifest_accepts_free_form_chunks() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        receiver.init_session("s1", None).await.unwrap();
        receiver.write_chunk("s1", 1, b" world").await.unwrap();
        receiver.write_chunk("s1", 0, b"hello").await.unwrap();

        let err = receiver.finish("s1", "greeting.txt", 3).await.unwrap_err();
        assert!(matches!(err, TransferError::MissingChunks(ref m) if m == &vec![2]));

        receiver.write_chunk("s1", 2, b"!").await.unwrap();
        let done = receiver.finish("s1", "greeting.txt", 3).await.unwrap();
        assert_eq!(std::fs::read_to_string(done.path).unwrap(), "hello world!");
        assert_eq!(done.session.declared_size, 12);
        assert_eq!(done.session.chunks[1].offset, 5);
    }

    #[tokio::test]
    async fn empty_file_finishes_without_chunks() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        receiver
            .init_session("s1", Some(manifest_for(b"", 64, false)))
            .await
            .unwrap();
        let done = receiver.finish("s1", "empty.txt", 0).await.unwrap();
        assert_eq!(std::fs::metadata(done.path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_session() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(64 * KIB);
        receiver
            .init_session("s1", Some(manifest_for(&data, 4 * KIB, true)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for (index, part) in data.chunks(4 * KIB).enumerate() {
            let receiver = receiver.clone();
            let part = part.to_vec();
            handles.push(tokio::spawn(async move {
                receiver.write_chunk("s1", index, &part).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let done = receiver.finish("s1", "f.bin", 16).await.unwrap();
        assert_eq!(std::fs::read(done.path).unwrap(), data);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        receiver.init_session("a", None).await.unwrap();
        receiver.init_session("b", None).await.unwrap();
        receiver.write_chunk("a", 0, b"aaa").await.unwrap();
        receiver.write_chunk("b", 0, b"bbb").await.unwrap();
        receiver.cancel("a").await.unwrap();

        let active = receiver.active_sessions().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");
        assert_eq!(receiver.received_indices("b").await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn open_clears_stale_chunk_data() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join(CHUNK_DIR).join("old");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("0"), b"x").unwrap();
        std::fs::write(tmp.path().join(CHUNK_DIR).join(".3.0.tmp"), b"x").unwrap();

        let mut config = ReceiverConfig::new(tmp.path());
        config.purge_stale = false;
        Receiver::open(config).await.unwrap();
        assert!(stale.exists());

        open(&tmp).await;
        assert!(!stale.exists());
        assert_eq!(std::fs::read_dir(tmp.path().join(CHUNK_DIR)).unwrap().count(), 0);
        assert!(tmp.path().join(CHUNK_DIR).is_dir());
    }

    #[tokio::test]
    async fn failed_session_can_be_reinitialised() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(100);
        let manifest = manifest_for(&data, 100, false);

        receiver.init_session("s1", Some(manifest.clone())).await.unwrap();
        receiver.write_chunk("s1", 0, &[0u8; 100]).await.unwrap();
        assert!(receiver.finish("s1", "f.bin", 1).await.is_err());

        receiver.init_session("s1", Some(manifest)).await.unwrap();
        receiver.write_chunk("s1", 0, &data).await.unwrap();
        receiver.finish("s1", "f.bin", 1).await.unwrap();
    }

    #[tokio::test]
    async fn prepared_file_round_trips_in_any_order() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data = pattern(150 * KIB + 3);
        let path = src.path().join("source.bin");
        std::fs::write(&path, &data).unwrap();

        let engine = ChunkEngine::new(32 * KIB as u64, 3);
        let mut session = engine.prepare(&path).await.unwrap();
        assert_eq!(session.total_chunks(), 5);
        let mut payloads = Vec::new();
        for chunk in &mut session.chunks {
            payloads.push(engine.read_chunk(&path, chunk).await.unwrap());
        }

        let receiver = open(&dst).await;
        receiver.init_from_request(&engine.manifest(&session)).await.unwrap();
        for index in [3, 0, 4, 2, 1] {
            receiver.write_chunk(&session.id, index, &payloads[index]).await.unwrap();
        }

        let done = receiver.finish(&session.id, "copy.bin", 5).await.unwrap();
        assert_eq!(std::fs::read(&done.path).unwrap(), data);
        assert_eq!(calculate_file_checksum(&done.path).unwrap(), session.expected_hash);
        assert_eq!(done.session.declared_size, data.len() as u64);
    }

    #[tokio::test]
    async fn session_without_hash_completes_on_chunk_presence() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(6 * KIB);
        let manifest = Manifest {
            hash: String::new(),
            ..manifest_for(&data, 4 * KIB, false)
        };

        receiver.init_session("s1", Some(manifest)).await.unwrap();
        receiver.write_chunk("s1", 1, &data[4 * KIB..]).await.unwrap();
        receiver.write_chunk("s1", 0, &data[..4 * KIB]).await.unwrap();

        let done = receiver.finish("s1", "nohash.bin", 2).await.unwrap();
        assert_eq!(std::fs::read(done.path).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_idle_and_failed_sessions() {
        let tmp = TempDir::new().unwrap();
        let receiver = open(&tmp).await;
        let data = pattern(8 * KIB);
        let idle = Duration::from_secs(600);

        receiver
            .init_session("stale", Some(manifest_for(&data, 4 * KIB, false)))
            .await
            .unwrap();
        receiver.write_chunk("stale", 0, &data[..4 * KIB]).await.unwrap();

        receiver
            .init_session("broken", Some(manifest_for(&data, 4 * KIB, false)))
            .await
            .unwrap();
        receiver.write_chunk("broken", 0, &[0u8; 4 * KIB]).await.unwrap();
        receiver.write_chunk("broken", 1, &data[4 * KIB..]).await.unwrap();
        assert!(receiver.finish("broken", "b.bin", 2).await.is_err());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(receiver.reap(idle).await, 0);

        receiver
            .init_session("busy", Some(manifest_for(&data, 4 * KIB, false)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        receiver.write_chunk("busy", 0, &data[..4 * KIB]).await.unwrap();

        assert_eq!(receiver.reap(idle).await, 2);
        assert!(receiver.session("stale").await.is_none());
        assert!(receiver.session("broken").await.is_none());
        assert!(!tmp.path().join(CHUNK_DIR).join("stale").exists());

        let busy = receiver.session("busy").await.unwrap();
        assert_eq!(busy.status, TransferStatus::InProgress);
        assert!(tmp.path().join(CHUNK_DIR).join("busy").join("0").exists());
    }
}
