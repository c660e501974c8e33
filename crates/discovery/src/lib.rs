//! LAN peer discovery.
//!
//! Independent [`DiscoverySource`]s (mDNS + multicast heartbeat, subnet HTTP
//! scan) keep their own sighting tables; the [`DiscoveryManager`] merges them
//! on a fixed tick into one deduplicated registry and notifies subscribers of
//! every change.

pub mod advertise;
pub mod heartbeat;
pub mod manager;
pub mod multicast;
pub mod net;
pub mod platform;
pub mod scan;
pub mod source;
pub mod store;
pub mod types;

// Re-export primary types.
pub use advertise::{Advertisement, Advertiser};
pub use manager::{
    BoxError, DEFAULT_MERGE_INTERVAL, DiscoveryManager, DiscoveryStats, SourceStats, merge,
};
pub use multicast::{MulticastConfig, MulticastSource};
pub use platform::{detect_device_type, detect_platform};
pub use scan::{ScanConfig, ScanSource};
pub use source::DiscoverySource;
pub use store::DeviceStore;
pub use types::{
    Device, DeviceStatus, DiscoveryEvent, SourceKind, UNKNOWN_PLATFORM, default_device_name,
};

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("discovery is already running")]
    AlreadyRunning,

    #[error("{kind} source failed to start: {error}")]
    SourceStart {
        kind: SourceKind,
        error: Box<DiscoveryError>,
    },
}
