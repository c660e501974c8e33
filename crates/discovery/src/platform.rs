//! Platform detection for this host and inference for remote hosts.

use airshare_protocol::DeviceType;

use crate::net::strip_local_suffix;
use crate::types::UNKNOWN_PLATFORM;

/// Returns the platform name this process advertises.
pub fn detect_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "macOS"
    } else if cfg!(target_os = "ios") {
        "iOS"
    } else if cfg!(target_os = "android") {
        "Android"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else {
        UNKNOWN_PLATFORM
    }
}

/// Returns the device class this process advertises.
pub fn detect_device_type() -> DeviceType {
    if cfg!(any(target_os = "ios", target_os = "android")) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

/// Metadata guessed from a remote host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHints {
    pub name: String,
    pub platform: String,
    pub device_type: DeviceType,
}

/// Guesses display name, platform and device class from an mDNS host name
/// such as `Johns-MacBook-Pro.local.`.
pub fn infer_from_hostname(host: &str) -> HostHints {
    let lower = host.to_ascii_lowercase();

    let device_type = if lower.contains("iphone") || lower.contains("android") {
        DeviceType::Mobile
    } else if lower.contains("ipad") || lower.contains("tablet") {
        DeviceType::Tablet
    } else if lower.contains("mac") || lower.contains("windows") || lower.contains("linux") {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    };

    let platform = if lower.contains("iphone") || lower.contains("ipad") {
        "iOS"
    } else if lower.contains("android") {
        "Android"
    } else if lower.contains("mac") {
        "macOS"
    } else if lower.contains("windows") {
        "Windows"
    } else if lower.contains("linux") {
        "Linux"
    } else {
        UNKNOWN_PLATFORM
    };

    HostHints {
        name: display_name(host),
        platform: platform.to_string(),
        device_type,
    }
}

/// Turns `johns-macbook-pro.local.` into `Johns Macbook Pro`.
pub fn display_name(host: &str) -> String {
    strip_local_suffix(host)
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
