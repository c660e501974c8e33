use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use airshare_protocol::{ChunkStatus, InitUploadRequest, TransferStatus};

use crate::TransferError;
use crate::chunked::{ChunkEngine, Progress};
use crate::receiver::Receiver;
use crate::types::TransferSession;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Destination of an upload.
///
/// An HTTP client implements this against a remote receiver; [`Receiver`]
/// implements it for in-process transfers. Keeping it a trait lets the
/// upload loop be tested with mocks.
pub trait ChunkSink: Send + Sync {
    /// Announces a session and its manifest.
    fn init<'a>(&'a self, manifest: &'a InitUploadRequest) -> SinkFuture<'a, ()>;

    /// Delivers one chunk payload.
    fn send_chunk<'a>(&'a self, id: &'a str, index: usize, payload: &'a [u8]) -> SinkFuture<'a, ()>;

    /// Asks the receiver to reassemble and verify the file.
    fn finish<'a>(&'a self, id: &'a str, file_name: &'a str, total: usize) -> SinkFuture<'a, ()>;

    /// Tells the receiver to drop the session and whatever it stored.
    fn cancel<'a>(&'a self, id: &'a str) -> SinkFuture<'a, ()>;
}

impl ChunkSink for Receiver {
    fn init<'a>(&'a self, manifest: &'a InitUploadRequest) -> SinkFuture<'a, ()> {
        Box::pin(self.init_from_request(manifest))
    }

    fn send_chunk<'a>(&'a self, id: &'a str, index: usize, payload: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(self.write_chunk(id, index, payload))
    }

    fn finish<'a>(&'a self, id: &'a str, file_name: &'a str, total: usize) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            Receiver::finish(self, id, file_name, total).await?;
            Ok(())
        })
    }

    fn cancel<'a>(&'a self, id: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(Receiver::cancel(self, id))
    }
}

/// Backoff between retry passes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry pass.
    pub initial_delay: Duration,
    /// Maximum delay between passes (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent pass.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry pass `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Events emitted while an upload runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress { session_id: String, progress: Progress },
    ChunkFailed { session_id: String, index: usize, retries: u32, error: String },
    Completed { session_id: String },
    Failed { session_id: String, error: String },
    Cancelled { session_id: String },
}

/// Drives a prepared session against a [`ChunkSink`].
pub struct Uploader<'a> {
    sink: &'a dyn ChunkSink,
    engine: ChunkEngine,
    policy: RetryPolicy,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<UploadEvent>>,
}

impl<'a> Uploader<'a> {
    pub fn new(sink: &'a dyn ChunkSink, engine: ChunkEngine, cancel: CancellationToken) -> Self {
        Self {
            sink,
            engine,
            policy: RetryPolicy::default(),
            cancel,
            events: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sends every chunk of `session` read from `path`, retrying failed chunks
    /// in backed-off passes, then asks the sink to finish.
    ///
    /// On return the session is completed, failed (error retained) or cancelled.
    /// A failed or cancelled upload also cancels the session on the sink so
    /// the receiver releases its chunk data.
    pub async fn upload(&self, path: &Path, session: &mut TransferSession) -> Result<(), TransferError> {
        let fresh = session.status == TransferStatus::Pending;
        let mut queue = self.engine.resume(session)?;
        let id = session.id.clone();
        // A resumed session was registered with the sink by an earlier run.
        let mut registered = !fresh;
        if self.cancel.is_cancelled() {
            return self.abort(session, registered).await;
        }

        if fresh {
            let manifest = self.engine.manifest(session);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = self.sink.init(&manifest) => Some(r),
            };
            match result {
                None => return self.abort(session, false).await,
                Some(Err(e)) => return self.fail(session, e, false).await,
                Some(Ok(())) => registered = true,
            }
        }

        let mut pass = 0;
        loop {
            for index in queue {
                if self.cancel.is_cancelled() {
                    return self.abort(session, registered).await;
                }
                if let Err(e) = self.send_one(path, session, index).await {
                    return match e {
                        TransferError::Cancelled => self.abort(session, registered).await,
                        e => self.fail(session, e, registered).await,
                    };
                }
            }

            if session.chunks.iter().all(|c| c.status == ChunkStatus::Sent) {
                break;
            }

            pass += 1;
            let delay = self.policy.delay_for_attempt(pass);
            tracing::debug!(session = %id, pass, delay_ms = delay.as_millis() as u64, "retrying failed chunks");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.abort(session, registered).await,
                _ = tokio::time::sleep(delay) => {}
            }

            queue = self.engine.resume(session)?;
            if queue.is_empty() {
                let missing = session
                    .chunks
                    .iter()
                    .filter(|c| c.status != ChunkStatus::Sent)
                    .map(|c| c.index)
                    .collect();
                return self
                    .fail(session, TransferError::MissingChunks(missing), registered)
                    .await;
            }
        }

        let finished = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            r = self.sink.finish(&id, &session.file_name, session.total_chunks()) => Some(r),
        };
        let Some(result) = finished else {
            return self.abort(session, registered).await;
        };
        if let Err(e) = result {
            return self.fail(session, e, registered).await;
        }

        session.complete()?;
        tracing::info!(session = %id, file = %session.file_name, "upload completed");
        self.emit(UploadEvent::Completed { session_id: id }).await;
        Ok(())
    }

    /// Sends one chunk. Transient failures are recorded on the chunk and
    /// swallowed; anything returned here ends the upload.
    async fn send_one(&self, path: &Path, session: &mut TransferSession, index: usize) -> Result<(), TransferError> {
        let id = session.id.clone();
        let chunk = &mut session.chunks[index];
        chunk.mark_sending()?;

        let result = match self.engine.read_chunk(path, chunk).await {
            Ok(payload) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                r = self.sink.send_chunk(&id, index, &payload) => r,
            },
            Err(e @ (TransferError::ShortRead { .. } | TransferError::ChecksumMismatch { .. })) => {
                return Err(e);
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                chunk.mark_sent()?;
                let progress = self.engine.progress(session);
                self.emit(UploadEvent::Progress { session_id: id, progress }).await;
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(session = %id, index, error = %error, "chunk send failed");
                let exhausted = self.engine.mark_chunk_failed(chunk, &error);
                let retries = chunk.retries;
                self.emit(UploadEvent::ChunkFailed {
                    session_id: id,
                    index,
                    retries,
                    error,
                })
                .await;
                exhausted
            }
        }
    }

    async fn fail(
        &self,
        session: &mut TransferSession,
        error: TransferError,
        registered: bool,
    ) -> Result<(), TransferError> {
        let message = error.to_string();
        tracing::error!(session = %session.id, error = %message, "upload failed");
        if session.is_active() {
            session.fail(message.clone())?;
        }
        if registered {
            self.release_remote(&session.id).await;
        }
        self.emit(UploadEvent::Failed {
            session_id: session.id.clone(),
            error: message,
        })
        .await;
        Err(error)
    }

    async fn abort(&self, session: &mut TransferSession, registered: bool) -> Result<(), TransferError> {
        if session.is_active() {
            session.cancel()?;
        }
        if registered {
            self.release_remote(&session.id).await;
        }
        tracing::info!(session = %session.id, "upload cancelled");
        self.emit(UploadEvent::Cancelled {
            session_id: session.id.clone(),
        })
        .await;
        Err(TransferError::Cancelled)
    }

    /// Best effort: the receiver may already have dropped the session.
    async fn release_remote(&self, id: &str) {
        if let Err(e) = self.sink.cancel(id).await {
            tracing::debug!(session = %id, error = %e, "sink did not cancel session");
        }
    }

    async fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}
