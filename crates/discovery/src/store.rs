//! Per-source table of device sightings.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use airshare_protocol::DeviceType;
use chrono::{DateTime, Utc};

use crate::types::{Device, DeviceStatus};

/// Outcome of a [`DeviceStore::sweep`].
#[derive(Debug, Default)]
pub struct Sweep {
    /// Devices that went stale since the previous sweep and are now marked offline.
    pub marked_offline: Vec<Device>,
    /// Devices that were already offline and have been deleted.
    pub removed: Vec<Device>,
}

/// Thread-safe device table keyed by device ID.
///
/// Readers always receive copies; the table itself never leaves the lock.
#[derive(Debug, Clone, Default)]
pub struct DeviceStore {
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting. Returns `true` if the device was not known before.
    ///
    /// Known metadata is never downgraded by a sparser sighting: a placeholder
    /// name, unknown platform or unknown type leaves the stored value alone.
    pub fn upsert(&self, sighting: Device) -> bool {
        let mut devices = self.write();
        match devices.get_mut(&sighting.id) {
            Some(existing) => {
                if !sighting.has_default_name() || existing.has_default_name() {
                    existing.name = sighting.name.clone();
                }
                if sighting.has_known_platform() {
                    existing.platform = sighting.platform;
                }
                if sighting.device_type != DeviceType::Unknown {
                    existing.device_type = sighting.device_type;
                }
                if !sighting.fingerprint.is_empty() {
                    existing.fingerprint = sighting.fingerprint;
                }
                existing.address = sighting.address;
                existing.port = sighting.port;
                existing.source = sighting.source;
                existing.status = DeviceStatus::Online;
                existing.last_seen = existing.last_seen.max(sighting.last_seen);
                false
            }
            None => {
                devices.insert(sighting.id.clone(), sighting);
                true
            }
        }
    }

    /// Freshens `last_seen` of a known device. Returns `false` if unknown.
    pub fn touch(&self, id: &str, at: DateTime<Utc>) -> bool {
        let mut devices = self.write();
        let Some(device) = devices.get_mut(id) else {
            return false;
        };
        device.last_seen = device.last_seen.max(at);
        device.status = DeviceStatus::Online;
        true
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.read().get(id).cloned()
    }

    /// Returns online devices confirmed within `cutoff` of `now`.
    pub fn online(&self, cutoff: Duration, now: DateTime<Utc>) -> Vec<Device> {
        self.read()
            .values()
            .filter(|d| d.status == DeviceStatus::Online && !d.is_stale(cutoff, now))
            .cloned()
            .collect()
    }

    /// Ages the table: stale online devices are marked offline, devices that
    /// were already offline and are still stale are deleted.
    pub fn sweep(&self, cutoff: Duration, now: DateTime<Utc>) -> Sweep {
        let mut devices = self.write();
        let mut sweep = Sweep::default();

        devices.retain(|_, device| {
            if !device.is_stale(cutoff, now) {
                return true;
            }
            match device.status {
                DeviceStatus::Online => {
                    device.status = DeviceStatus::Offline;
                    sweep.marked_offline.push(device.clone());
                    true
                }
                DeviceStatus::Offline => {
                    sweep.removed.push(device.clone());
                    false
                }
            }
        });

        sweep
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
