use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use airshare_protocol::DeviceType;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Platform value used when nothing better is known.
pub const UNKNOWN_PLATFORM: &str = "unknown";

/// Returns the placeholder name given to devices that never told us theirs.
pub fn default_device_name(address: IpAddr) -> String {
    format!("device-{address}")
}

/// Liveness of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Which discovery source produced a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Multicast,
    Scan,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Multicast => write!(f, "multicast"),
            SourceKind::Scan => write!(f, "scan"),
        }
    }
}

/// A peer device seen on the local network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub device_type: DeviceType,
    pub address: IpAddr,
    pub port: u16,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

impl Device {
    /// Creates an online device with placeholder metadata, seen now.
    pub fn new(id: impl Into<String>, address: IpAddr, port: u16, source: SourceKind) -> Self {
        Self {
            id: id.into(),
            name: default_device_name(address),
            platform: UNKNOWN_PLATFORM.to_string(),
            device_type: DeviceType::Unknown,
            address,
            port,
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            source,
            fingerprint: String::new(),
        }
    }

    /// Endpoint for reaching the device's HTTP API.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn has_default_name(&self) -> bool {
        self.name.is_empty() || self.name == default_device_name(self.address)
    }

    pub fn has_known_platform(&self) -> bool {
        !self.platform.is_empty() && !self.platform.eq_ignore_ascii_case(UNKNOWN_PLATFORM)
    }

    /// Metadata completeness used to pick a survivor among duplicates.
    ///
    /// A real name is worth 10, a known device type 5, a known platform 5.
    pub fn completeness(&self) -> u32 {
        let mut score = 0;
        if !self.has_default_name() {
            score += 10;
        }
        if self.device_type != DeviceType::Unknown {
            score += 5;
        }
        if self.has_known_platform() {
            score += 5;
        }
        score
    }

    /// Returns true if the device has not been confirmed within `cutoff` of `now`.
    pub fn is_stale(&self, cutoff: Duration, now: DateTime<Utc>) -> bool {
        match TimeDelta::from_std(cutoff) {
            Ok(cutoff) => now.signed_duration_since(self.last_seen) > cutoff,
            Err(_) => false,
        }
    }

    /// Compares everything except liveness bookkeeping (`status`, `last_seen`).
    pub(crate) fn same_description(&self, other: &Device) -> bool {
        self.name == other.name
            && self.platform == other.platform
            && self.device_type == other.device_type
            && self.address == other.address
            && self.port == other.port
            && self.source == other.source
            && self.fingerprint == other.fingerprint
    }
}

/// A change to the canonical device registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added(Device),
    Updated(Device),
    Removed(Device),
}

impl DiscoveryEvent {
    pub fn device(&self) -> &Device {
        match self {
            DiscoveryEvent::Added(d) | DiscoveryEvent::Updated(d) | DiscoveryEvent::Removed(d) => d,
        }
    }
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::Added(d) => write!(f, "added {}", d.id),
            DiscoveryEvent::Updated(d) => write!(f, "updated {}", d.id),
            DiscoveryEvent::Removed(d) => write!(f, "removed {}", d.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip: &str) -> Device {
        Device::new(format!("http-{ip}"), ip.parse().unwrap(), 8080, SourceKind::Scan)
    }

    #[test]
    fn new_device_has_placeholder_metadata() {
        let d = device("192.168.1.20");
        assert_eq!(d.name, "device-192.168.1.20");
        assert!(d.has_default_name());
        assert!(!d.has_known_platform());
        assert_eq!(d.status, DeviceStatus::Online);
        assert_eq!(d.endpoint().to_string(), "192.168.1.20:8080");
    }

    #[test]
    fn completeness_weights() {
        let mut d = device("10.0.0.2");
        assert_eq!(d.completeness(), 0);

        d.platform = "Linux".into();
        assert_eq!(d.completeness(), 5);

        d.device_type = DeviceType::Desktop;
        assert_eq!(d.completeness(), 10);

        d.name = "Workstation".into();
        assert_eq!(d.completeness(), 20);

        d.name = String::new();
        assert_eq!(d.completeness(), 10);
    }

    #[test]
    fn platform_unknown_is_case_insensitive() {
        let mut d = device("10.0.0.2");
        d.platform = "Unknown".into();
        assert!(!d.has_known_platform());
    }

    #[test]
    fn staleness_uses_cutoff() {
        let mut d = device("10.0.0.3");
        let now = Utc::now();
        d.last_seen = now - TimeDelta::seconds(29);
        assert!(!d.is_stale(Duration::from_secs(30), now));
        d.last_seen = now - TimeDelta::seconds(31);
        assert!(d.is_stale(Duration::from_secs(30), now));
    }

    #[test]
    fn description_ignores_liveness() {
        let a = device("10.0.0.4");
        let mut b = a.clone();
        b.last_seen = a.last_seen + TimeDelta::seconds(5);
        b.status = DeviceStatus::Offline;
        assert!(a.same_description(&b));

        b.port = 9090;
        assert!(!a.same_description(&b));
    }

    #[test]
    fn event_display() {
        let d = device("10.0.0.5");
        assert_eq!(DiscoveryEvent::Added(d.clone()).to_string(), "added http-10.0.0.5");
        assert_eq!(DiscoveryEvent::Removed(d).to_string(), "removed http-10.0.0.5");
    }

    #[test]
    fn device_json_is_camel_case() {
        let d = device("10.0.0.6");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["deviceType"], "unknown");
        assert_eq!(json["source"], "scan");
        assert_eq!(json["status"], "online");
        assert!(json.get("fingerprint").is_none());
    }
}
