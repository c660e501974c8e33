use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use airshare_protocol::constants::{
    HEARTBEAT_INTERVAL, MULTICAST_GROUP, MULTICAST_PORT, service_type,
};
use airshare_protocol::{Beacon, DeviceType};
use mdns_sd::{ServiceDaemon, ServiceInfo as MdnsServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::DiscoveryError;
use crate::heartbeat;
use crate::net::{hostname, local_ipv4s, mdns_hostname};

/// What this peer tells the network about itself.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// mDNS instance name; unique per running peer.
    pub instance: String,
    pub name: String,
    pub platform: String,
    pub device_type: DeviceType,
    pub port: u16,
    /// Content fingerprint published in the `fp` TXT key.
    pub fingerprint: String,
    /// Addresses to advertise. Empty means every usable local IPv4.
    pub ips: Vec<IpAddr>,
}

impl Advertisement {
    /// TXT properties published with the service record.
    pub fn txt_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("platform", self.platform.clone()),
            ("type", self.device_type.to_string()),
            ("port", self.port.to_string()),
            ("fp", self.fingerprint.clone()),
        ]
    }

    /// Heartbeat beacon matching this advertisement.
    pub fn beacon(&self) -> Beacon {
        let mut beacon = Beacon::new(hostname(), self.port);
        beacon.name = self.name.clone();
        beacon.platform = self.platform.clone();
        beacon.device_type = self.device_type;
        beacon
    }
}

/// Advertises this peer via mDNS and the multicast heartbeat.
pub struct Advertiser {
    info: Advertisement,
    daemon: Option<ServiceDaemon>,
    heartbeat: Option<CancellationToken>,
    heartbeat_interval: Duration,
    heartbeat_target: SocketAddr,
}

impl Advertiser {
    pub fn new(info: Advertisement) -> Self {
        Self {
            info,
            daemon: None,
            heartbeat: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_target: SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT)),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Registers the mDNS service record.
    ///
    /// The port must be set before calling start (no default).
    /// Safe to call multiple times: stops the existing daemon before re-registering.
    pub fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.info.port == 0 {
            return Err(DiscoveryError::Config(
                "port must be set before advertising".into(),
            ));
        }

        self.stop();

        let ips: Vec<IpAddr> = if self.info.ips.is_empty() {
            local_ipv4s().into_iter().map(IpAddr::V4).collect()
        } else {
            self.info.ips.clone()
        };
        if ips.is_empty() {
            return Err(DiscoveryError::Network("no valid network IPs found".into()));
        }

        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let service_type = service_type();
        let properties = self.info.txt_properties();
        let properties: Vec<(&str, &str)> =
            properties.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let service = MdnsServiceInfo::new(
            &service_type,
            &self.info.instance,
            &mdns_hostname(),
            &ips[..],
            self.info.port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Mdns(format!("failed to create service info: {e}")))?;

        if let Err(e) = daemon.register(service) {
            let _ = daemon.shutdown();
            return Err(DiscoveryError::Mdns(format!(
                "failed to register mDNS service '{}': {e}",
                self.full_name()
            )));
        }

        info!(
            instance = %self.info.instance,
            port = self.info.port,
            addresses = ips.len(),
            "mDNS service registered"
        );
        self.daemon = Some(daemon);
        Ok(())
    }

    /// Starts the heartbeat announcer on the current runtime.
    pub fn start_heartbeat(&mut self, cancel: &CancellationToken) {
        self.stop_heartbeat();
        let token = cancel.child_token();
        let beacon = self.info.beacon();
        let target = self.heartbeat_target;
        let interval = self.heartbeat_interval;
        let task_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = heartbeat::announce(beacon, target, interval, task_token).await {
                warn!(error = %e, "heartbeat announcer failed");
            }
        });
        self.heartbeat = Some(token);
    }

    fn stop_heartbeat(&mut self) {
        if let Some(token) = self.heartbeat.take() {
            token.cancel();
        }
    }

    /// Stops advertising: unregisters the record and stops the heartbeat.
    pub fn stop(&mut self) {
        self.stop_heartbeat();
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.unregister(&self.full_name());
            let _ = daemon.shutdown();
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn info(&self) -> &Advertisement {
        &self.info
    }

    /// Registers, announces, and runs until the cancellation token is triggered.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        self.start()?;
        self.start_heartbeat(&cancel);
        cancel.cancelled().await;
        self.stop();
        Ok(())
    }

    fn full_name(&self) -> String {
        format!("{}.{}", self.info.instance, service_type())
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
