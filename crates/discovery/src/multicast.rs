//! mDNS browsing plus heartbeat listening.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use airshare_protocol::DeviceType;
use airshare_protocol::constants::{MULTICAST_GROUP, MULTICAST_PORT, service_type};
use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::DiscoveryError;
use crate::heartbeat;
use crate::net::{is_usable_ipv4, local_ipv4s, strip_local_suffix};
use crate::platform::infer_from_hostname;
use crate::source::{DiscoverySource, RunState};
use crate::store::DeviceStore;
use crate::types::{Device, SourceKind};

/// Configuration for [`MulticastSource`].
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Sweep cadence; devices silent for three intervals go offline.
    pub scan_interval: Duration,
    /// Also listen for heartbeat beacons on the multicast group.
    pub listen_heartbeats: bool,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            listen_heartbeats: true,
            group: MULTICAST_GROUP,
            port: MULTICAST_PORT,
        }
    }
}

impl MulticastConfig {
    pub fn offline_cutoff(&self) -> Duration {
        self.scan_interval * 3
    }
}

/// Discovers peers through mDNS service resolution and heartbeat beacons.
pub struct MulticastSource {
    config: MulticastConfig,
    store: DeviceStore,
    run: RunState,
}

impl MulticastSource {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            config,
            store: DeviceStore::new(),
            run: RunState::default(),
        }
    }

    /// Raw per-source table, including devices already marked offline.
    pub fn store(&self) -> &DeviceStore {
        &self.store
    }
}

impl DiscoverySource for MulticastSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Multicast
    }

    fn start(&self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        if self.run.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        if self.config.scan_interval.is_zero() {
            return Err(DiscoveryError::Config("scan interval must be non-zero".into()));
        }

        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let browse = match daemon.browse(&service_type()) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(DiscoveryError::Mdns(format!("failed to browse mDNS: {e}")));
            }
        };

        let listener = if self.config.listen_heartbeats {
            match heartbeat::bind_listener(self.config.group, self.config.port) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    let _ = daemon.shutdown();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let token = match self.run.begin(&cancel) {
            Ok(token) => token,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(e);
            }
        };

        let local: HashSet<Ipv4Addr> = local_ipv4s().into_iter().collect();

        // Drain the blocking mDNS receiver into a channel the loop can select on.
        let (events_tx, events_rx) = mpsc::channel(64);
        let forward_cancel = token.clone();
        tokio::task::spawn_blocking(move || {
            while !forward_cancel.is_cancelled() {
                match browse.recv_timeout(Duration::from_millis(500)) {
                    Ok(event) => {
                        if events_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(_) if browse.is_disconnected() => break,
                    Err(_) => {}
                }
            }
        });

        tokio::spawn(browse_loop(
            daemon,
            events_rx,
            self.store.clone(),
            local.clone(),
            self.config.clone(),
            token.clone(),
        ));

        if let Some(socket) = listener {
            let store = self.store.clone();
            tokio::spawn(heartbeat::listen(socket, token, move |beacon, from| {
                let IpAddr::V4(v4) = from.ip() else {
                    return;
                };
                if local.contains(&v4) {
                    return;
                }
                if let Some(device) = heartbeat::device_from_beacon(&beacon, from.ip()) {
                    trace!(device = %device.id, "heartbeat");
                    if store.upsert(device.clone()) {
                        debug!(device = %device.id, %from, "device announced itself via heartbeat");
                    }
                }
            }));
        }

        info!(
            service = %service_type(),
            heartbeats = self.config.listen_heartbeats,
            "multicast discovery started"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.run.is_running() {
            debug!("stopping multicast discovery");
        }
        self.run.end();
    }

    fn is_running(&self) -> bool {
        self.run.is_running()
    }

    fn online_devices(&self) -> Vec<Device> {
        self.store.online(self.config.offline_cutoff(), Utc::now())
    }
}

async fn browse_loop(
    daemon: ServiceDaemon,
    mut events: mpsc::Receiver<ServiceEvent>,
    store: DeviceStore,
    local: HashSet<Ipv4Addr>,
    config: MulticastConfig,
    cancel: CancellationToken,
) {
    let mut sweep_ticker = tokio::time::interval(config.scan_interval);
    sweep_ticker.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("mDNS event stream closed");
                    break;
                };
                handle_event(&store, &local, &event);
            }
            _ = sweep_ticker.tick() => {
                let sweep = store.sweep(config.offline_cutoff(), Utc::now());
                for device in &sweep.marked_offline {
                    debug!(device = %device.id, "mDNS device went offline");
                }
                for device in &sweep.removed {
                    debug!(device = %device.id, "mDNS device forgotten");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = daemon.shutdown();
    debug!("mDNS browse loop stopped");
}

fn handle_event(store: &DeviceStore, local: &HashSet<Ipv4Addr>, event: &ServiceEvent) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            for device in sightings_from_service(info) {
                let IpAddr::V4(v4) = device.address else {
                    continue;
                };
                if local.contains(&v4) {
                    continue;
                }
                let id = device.id.clone();
                if store.upsert(device) {
                    info!(device = %id, "discovered device via mDNS");
                }
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            // Goodbye packets are advisory; the offline cutoff decides.
            debug!(service = %fullname, "mDNS service removed");
        }
        _ => {}
    }
}

/// Turns a resolved mDNS service into one sighting per usable IPv4 address.
pub(crate) fn sightings_from_service(info: &ServiceInfo) -> Vec<Device> {
    let host = strip_local_suffix(info.get_hostname()).to_string();
    let hints = infer_from_hostname(info.get_hostname());

    let mut name = String::new();
    let mut platform = String::new();
    let mut device_type = DeviceType::Unknown;
    let mut fingerprint = String::new();
    let mut port = info.get_port();

    for property in info.get_properties().iter() {
        let val = property.val_str();
        match property.key() {
            "name" | "device" => name = val.to_string(),
            "platform" => platform = val.to_string(),
            "type" => device_type = DeviceType::parse(val),
            "fp" => fingerprint = val.to_string(),
            "port" => {
                if let Ok(p) = val.parse::<u16>()
                    && p != 0
                {
                    port = p;
                }
            }
            _ => {}
        }
    }

    if name.is_empty() {
        name = hints.name;
    }
    if platform.is_empty() {
        platform = hints.platform;
    }
    if device_type == DeviceType::Unknown {
        device_type = hints.device_type;
    }

    info.get_addresses()
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) if is_usable_ipv4(*v4) => Some(*v4),
            _ => None,
        })
        .map(|v4| {
            let mut device = Device::new(
                format!("{v4}-{host}"),
                IpAddr::V4(v4),
                port,
                SourceKind::Multicast,
            );
            if !name.is_empty() {
                device.name = name.clone();
            }
            device.platform = platform.clone();
            device.device_type = device_type;
            device.fingerprint = fingerprint.clone();
            device
        })
        .collect()
}
