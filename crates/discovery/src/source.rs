use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::DiscoveryError;
use crate::types::{Device, SourceKind};

/// A producer of device sightings with its own scan cadence.
///
/// Implementations keep a private [`DeviceStore`](crate::DeviceStore), apply
/// their own offline cutoff, and only ever hand out copies of it.
pub trait DiscoverySource: Send + Sync {
    /// Which kind of source this is (used for logging and stats).
    fn kind(&self) -> SourceKind;

    /// Spawns the source's background tasks on the current Tokio runtime.
    ///
    /// The tasks stop when `cancel` fires or [`stop`](Self::stop) is called.
    /// Fails with [`DiscoveryError::AlreadyRunning`] if already started.
    fn start(&self, cancel: CancellationToken) -> Result<(), DiscoveryError>;

    /// Stops the background tasks. No-op if not running.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Devices currently online according to this source alone.
    fn online_devices(&self) -> Vec<Device>;
}

/// Start/stop bookkeeping shared by the source implementations.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    token: Mutex<Option<CancellationToken>>,
}

impl RunState {
    /// Claims the running slot, returning the token the tasks should watch.
    pub(crate) fn begin(
        &self,
        parent: &CancellationToken,
    ) -> Result<CancellationToken, DiscoveryError> {
        let mut slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let token = parent.child_token();
        *slot = Some(token.clone());
        Ok(token)
    }

    pub(crate) fn end(&self) {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}
