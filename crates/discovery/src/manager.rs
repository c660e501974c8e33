//! Fuses every discovery source into one canonical device registry.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::DiscoveryError;
use crate::source::DiscoverySource;
use crate::types::{Device, DeviceStatus, DiscoveryEvent, SourceKind};

/// Interval between merge cycles.
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(5);

/// Error type subscriber callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type EventCallback = Arc<dyn Fn(DiscoveryEvent) -> Result<(), BoxError> + Send + Sync>;
type Registry = Arc<RwLock<HashMap<String, Device>>>;
type Subscribers = Arc<RwLock<Vec<mpsc::UnboundedSender<DiscoveryEvent>>>>;

/// Everything one merge cycle touches. Cycles are serialised by `cycle`, held
/// from collecting sightings until the events are queued.
#[derive(Clone)]
struct Merger {
    sources: Vec<Arc<dyn DiscoverySource>>,
    registry: Registry,
    subscribers: Subscribers,
    cycle: Arc<Mutex<()>>,
}

impl Merger {
    fn run(&self) {
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        let sightings: Vec<Device> = self.sources.iter().flat_map(|s| s.online_devices()).collect();

        let events = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let (next, events) = merge(&registry, sightings);
            *registry = next;
            events
        };

        if events.is_empty() {
            return;
        }
        debug!(events = events.len(), "registry changed");

        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| {
            events
                .iter()
                .all(|event| tx.send(event.clone()).is_ok())
        });
    }
}

/// Snapshot of manager and source health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub running: bool,
    pub total_devices: usize,
    pub online_devices: usize,
    pub sources: Vec<SourceStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub kind: SourceKind,
    pub running: bool,
    pub online_devices: usize,
}

struct Running {
    cancel: CancellationToken,
    merge_task: JoinHandle<()>,
}

/// Owns the discovery sources and the merged device registry.
pub struct DiscoveryManager {
    sources: Vec<Arc<dyn DiscoverySource>>,
    registry: Registry,
    subscribers: Subscribers,
    cycle: Arc<Mutex<()>>,
    merge_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl DiscoveryManager {
    pub fn new(sources: Vec<Arc<dyn DiscoverySource>>) -> Self {
        Self {
            sources,
            registry: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            cycle: Arc::new(Mutex::new(())),
            merge_interval: DEFAULT_MERGE_INTERVAL,
            running: Mutex::new(None),
        }
    }

    pub fn with_merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Starts every source and the periodic merge loop.
    ///
    /// If any source fails to start, the ones already started are stopped and
    /// the error is returned. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        if self.merge_interval.is_zero() {
            return Err(DiscoveryError::Config("merge interval must be non-zero".into()));
        }

        let cancel = CancellationToken::new();
        for (i, source) in self.sources.iter().enumerate() {
            if let Err(e) = source.start(cancel.child_token()) {
                error!(source = %source.kind(), error = %e, "discovery source failed to start");
                for started in &self.sources[..i] {
                    started.stop();
                }
                cancel.cancel();
                return Err(DiscoveryError::SourceStart {
                    kind: source.kind(),
                    error: Box::new(e),
                });
            }
        }

        let merge_task = tokio::spawn(merge_loop(self.merger(), self.merge_interval, cancel.clone()));

        *running = Some(Running { cancel, merge_task });
        info!(
            sources = self.sources.len(),
            merge_interval_ms = self.merge_interval.as_millis() as u64,
            "discovery started"
        );
        Ok(())
    }

    /// Stops the merge loop and every source, and clears the registry.
    ///
    /// Safe to call in any state; a no-op when not running.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        for source in &self.sources {
            source.stop();
        }
        if let Err(e) = running.merge_task.await {
            warn!(error = %e, "merge loop ended abnormally");
        }
        {
            let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        info!("discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Registers a subscriber for registry changes.
    ///
    /// Each subscriber gets its own worker, so events reach it in order and a
    /// slow subscriber never delays the merge loop or other subscribers.
    /// Errors and panics raised by the callback are logged and swallowed.
    /// Must be called from within a Tokio runtime.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(DiscoveryEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let (tx, mut rx) = mpsc::unbounded_channel::<DiscoveryEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let label = event.to_string();
                let cb = Arc::clone(&callback);
                match tokio::task::spawn_blocking(move || cb(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(event = %label, error = %e, "discovery subscriber returned an error");
                    }
                    Err(e) if e.is_panic() => {
                        error!(event = %label, "discovery subscriber panicked");
                    }
                    Err(e) => debug!(error = %e, "discovery subscriber task cancelled"),
                }
            }
        });

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
    }

    /// Snapshot of every online device.
    pub fn online_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .read_registry()
            .values()
            .filter(|d| d.status == DeviceStatus::Online)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn device_by_address(&self, address: IpAddr) -> Option<Device> {
        self.read_registry()
            .values()
            .find(|d| d.address == address && d.status == DeviceStatus::Online)
            .cloned()
    }

    pub fn device_by_id(&self, id: &str) -> Option<Device> {
        self.read_registry()
            .get(id)
            .filter(|d| d.status == DeviceStatus::Online)
            .cloned()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let (total_devices, online_devices) = {
            let registry = self.read_registry();
            let online = registry
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count();
            (registry.len(), online)
        };

        DiscoveryStats {
            running: self.is_running(),
            total_devices,
            online_devices,
            sources: self
                .sources
                .iter()
                .map(|s| SourceStats {
                    kind: s.kind(),
                    running: s.is_running(),
                    online_devices: s.online_devices().len(),
                })
                .collect(),
        }
    }

    /// Runs one merge cycle immediately. Waits for a cycle already in
    /// progress on the merge loop rather than overlapping it.
    pub fn merge_now(&self) {
        self.merger().run();
    }

    fn merger(&self) -> Merger {
        Merger {
            sources: self.sources.clone(),
            registry: Arc::clone(&self.registry),
            subscribers: Arc::clone(&self.subscribers),
            cycle: Arc::clone(&self.cycle),
        }
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Device>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn merge_loop(merger: Merger, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => merger.run(),
        }
    }

    debug!("merge loop stopped");
}

/// Computes the next canonical registry from the previous one and this
/// cycle's sightings, plus the events that describe the difference.
///
/// - Sightings sharing an ID collapse to the freshest one.
/// - Sightings sharing an address collapse to the most complete one, ties
///   going to the lowest ID; the survivor carries the group's latest
///   `last_seen`.
/// - IDs that vanished are reported as `Removed` with status offline.
pub fn merge(
    previous: &HashMap<String, Device>,
    sightings: impl IntoIterator<Item = Device>,
) -> (HashMap<String, Device>, Vec<DiscoveryEvent>) {
    let mut by_id: HashMap<String, Device> = HashMap::new();
    for sighting in sightings {
        match by_id.get(&sighting.id) {
            Some(existing) if existing.last_seen > sighting.last_seen => {}
            _ => {
                by_id.insert(sighting.id.clone(), sighting);
            }
        }
    }

    let mut by_address: BTreeMap<IpAddr, Vec<Device>> = BTreeMap::new();
    for device in by_id.into_values() {
        by_address.entry(device.address).or_default().push(device);
    }

    let mut next = HashMap::new();
    for (address, mut group) in by_address {
        let latest = group.iter().map(|d| d.last_seen).max();
        group.sort_by(|a, b| {
            b.completeness()
                .cmp(&a.completeness())
                .then_with(|| a.id.cmp(&b.id))
        });
        if group.len() > 1 {
            debug!(
                %address,
                kept = %group[0].id,
                dropped = group.len() - 1,
                "collapsed duplicate devices"
            );
        }
        let Some(mut survivor) = group.into_iter().next() else {
            continue;
        };
        if let Some(latest) = latest {
            survivor.last_seen = latest;
        }
        survivor.status = DeviceStatus::Online;
        next.insert(survivor.id.clone(), survivor);
    }

    let mut ids: Vec<&String> = next.keys().collect();
    ids.sort();
    let mut events = Vec::new();
    for id in ids {
        let device = &next[id];
        match previous.get(id) {
            None => events.push(DiscoveryEvent::Added(device.clone())),
            Some(old) if !old.same_description(device) => {
                events.push(DiscoveryEvent::Updated(device.clone()));
            }
            Some(_) => {}
        }
    }

    let mut gone: Vec<&Device> = previous
        .values()
        .filter(|d| !next.contains_key(&d.id))
        .collect();
    gone.sort_by(|a, b| a.id.cmp(&b.id));
    for device in gone {
        let mut removed = device.clone();
        removed.status = DeviceStatus::Offline;
        events.push(DiscoveryEvent::Removed(removed));
    }

    (next, events)
}
