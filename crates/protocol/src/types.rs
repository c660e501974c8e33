use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::BEACON_SERVICE;

/// Broad class of a peer device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Unknown,
    Desktop,
    Mobile,
    Tablet,
    Web,
}

impl DeviceType {
    /// Parses a TXT-record or status value, falling back to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Self::Desktop,
            "mobile" => Self::Mobile,
            "tablet" => Self::Tablet,
            "web" => Self::Web,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single chunk within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Sending,
    Sent,
    Received,
    Failed,
    Verified,
}

impl ChunkStatus {
    /// Statuses whose bytes count towards transfer progress.
    pub fn is_transferred(&self) -> bool {
        matches!(self, Self::Sent | Self::Received | Self::Verified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Failed => "failed",
            Self::Verified => "verified",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence beacon sent to the heartbeat multicast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub service: String,
    /// Host name of the sender, without the `.local.` suffix.
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, rename = "type")]
    pub device_type: DeviceType,
    pub port: u16,
}

impl Beacon {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            service: BEACON_SERVICE.to_string(),
            host: host.into(),
            name: String::new(),
            platform: String::new(),
            device_type: DeviceType::Unknown,
            port,
        }
    }

    /// Decodes a datagram, returning `None` for foreign or malformed payloads.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let beacon: Beacon = serde_json::from_slice(datagram).ok()?;
        (beacon.service == BEACON_SERVICE && !beacon.host.is_empty()).then_some(beacon)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_parse_is_lenient() {
        assert_eq!(DeviceType::parse("Desktop"), DeviceType::Desktop);
        assert_eq!(DeviceType::parse(" mobile "), DeviceType::Mobile);
        assert_eq!(DeviceType::parse("toaster"), DeviceType::Unknown);
        assert_eq!(DeviceType::parse(""), DeviceType::Unknown);
    }

    #[test]
    fn transfer_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
    }

    #[test]
    fn chunk_status_transferred() {
        assert!(ChunkStatus::Sent.is_transferred());
        assert!(ChunkStatus::Verified.is_transferred());
        assert!(!ChunkStatus::Failed.is_transferred());
        assert!(!ChunkStatus::Sending.is_transferred());
    }

    #[test]
    fn beacon_rejects_foreign_service() {
        let other = br#"{"service":"other","host":"box","port":1}"#;
        assert!(Beacon::decode(other).is_none());
        assert!(Beacon::decode(b"AIRSHARE_PRESENCE").is_none());

        let mut beacon = Beacon::new("laptop", 8080);
        beacon.name = "Laptop".into();
        let decoded = Beacon::decode(&beacon.encode().unwrap()).unwrap();
        assert_eq!(decoded, beacon);
    }
}
