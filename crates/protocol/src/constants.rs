use std::net::Ipv4Addr;
use std::time::Duration;

/// mDNS service type advertised by every peer.
pub const SERVICE_NAME: &str = "_airshare._tcp";

/// mDNS domain the service type lives under.
pub const SERVICE_DOMAIN: &str = "local.";

/// Multicast group used for presence heartbeats.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// UDP port of the heartbeat multicast group.
pub const MULTICAST_PORT: u16 = 53317;

/// Service tag carried in every heartbeat beacon.
pub const BEACON_SERVICE: &str = "airshare";

/// How often a running peer announces itself on the multicast group.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Default HTTP port of the file API.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Status endpoint probed by subnet scans.
pub const STATUS_PATH: &str = "/api/status";

/// Default transfer chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

/// Default upper bound on a single transferred file: 1 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Hidden directory under the storage root that holds in-flight chunks.
pub const CHUNK_DIR: &str = ".chunks";

/// Returns the fully-qualified mDNS service type (`_airshare._tcp.local.`).
pub fn service_type() -> String {
    format!("{SERVICE_NAME}.{SERVICE_DOMAIN}")
}
