//! Agent configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/airshare/agent.toml`
//! - Windows: `%APPDATA%/airshare/agent.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use airshare_discovery::{MulticastConfig, ScanConfig, detect_device_type};
use airshare_protocol::DeviceType;
use airshare_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_HTTP_PORT, DEFAULT_MAX_FILE_SIZE, HEARTBEAT_INTERVAL,
};
use airshare_transfer::{ChunkEngine, DEFAULT_MAX_RETRIES, ReceiverConfig};
use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this peer (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Port of the HTTP file endpoints, advertised to peers.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory received files are stored in (`~` is expanded).
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Device class advertised to peers.
    #[serde(default = "detect_device_type")]
    pub device_type: DeviceType,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub transfer: TransferSettings,
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mdns_scan_interval")]
    pub mdns_scan_interval_secs: u64,

    /// Subnet HTTP scanning; off by default as it probes every LAN host.
    #[serde(default)]
    pub scan_enabled: bool,

    #[serde(default = "default_http_scan_interval")]
    pub http_scan_interval_secs: u64,

    #[serde(default = "default_http_probe_timeout")]
    pub http_probe_timeout_ms: u64,

    #[serde(default = "default_merge_interval")]
    pub merge_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// `[transfer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Sessions untouched this long are cancelled and their chunks deleted.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "AirShare".into())
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_storage_path() -> String {
    "~/AirShare".into()
}

fn default_true() -> bool {
    true
}

fn default_mdns_scan_interval() -> u64 {
    10
}

fn default_http_scan_interval() -> u64 {
    30
}

fn default_http_probe_timeout() -> u64 {
    1500
}

fn default_merge_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL.as_secs()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mdns_scan_interval_secs: default_mdns_scan_interval(),
            scan_enabled: false,
            http_scan_interval_secs: default_http_scan_interval(),
            http_probe_timeout_ms: default_http_probe_timeout(),
            merge_interval_secs: default_merge_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            max_file_size: default_max_file_size(),
            session_ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl TransferSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            storage_path: default_storage_path(),
            device_type: detect_device_type(),
            discovery: DiscoverySettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl DiscoverySettings {
    pub fn multicast(&self) -> MulticastConfig {
        MulticastConfig {
            scan_interval: Duration::from_secs(self.mdns_scan_interval_secs),
            ..MulticastConfig::default()
        }
    }

    pub fn scan(&self, port: u16) -> ScanConfig {
        ScanConfig {
            scan_interval: Duration::from_secs(self.http_scan_interval_secs),
            probe_timeout: Duration::from_millis(self.http_probe_timeout_ms),
            port,
            ..ScanConfig::default()
        }
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_secs(self.merge_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating a
    /// default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects values the services cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.port != 0, "port must be non-zero");
        anyhow::ensure!(self.transfer.chunk_size > 0, "transfer.chunk_size must be non-zero");
        anyhow::ensure!(self.transfer.max_retries > 0, "transfer.max_retries must be non-zero");
        anyhow::ensure!(
            self.transfer.chunk_size <= self.transfer.max_file_size,
            "transfer.chunk_size exceeds transfer.max_file_size"
        );
        anyhow::ensure!(self.transfer.session_ttl_secs > 0, "transfer.session_ttl_secs must be non-zero");
        anyhow::ensure!(
            self.transfer.cleanup_interval_secs > 0,
            "transfer.cleanup_interval_secs must be non-zero"
        );
        let d = &self.discovery;
        anyhow::ensure!(d.mdns_scan_interval_secs > 0, "discovery.mdns_scan_interval_secs must be non-zero");
        anyhow::ensure!(d.http_scan_interval_secs > 0, "discovery.http_scan_interval_secs must be non-zero");
        anyhow::ensure!(d.http_probe_timeout_ms > 0, "discovery.http_probe_timeout_ms must be non-zero");
        anyhow::ensure!(d.merge_interval_secs > 0, "discovery.merge_interval_secs must be non-zero");
        anyhow::ensure!(d.heartbeat_interval_secs > 0, "discovery.heartbeat_interval_secs must be non-zero");
        Ok(())
    }

    /// Storage directory with a leading `~` expanded.
    pub fn storage_dir(&self) -> PathBuf {
        expand_home(&self.storage_path)
    }

    /// Receiver settings; `purge_stale` is for the long-running agent only.
    pub fn receiver_config(&self, purge_stale: bool) -> ReceiverConfig {
        ReceiverConfig {
            storage_dir: self.storage_dir(),
            max_file_size: self.transfer.max_file_size,
            purge_stale,
        }
    }

    pub fn chunk_engine(&self) -> ChunkEngine {
        ChunkEngine::new(self.transfer.chunk_size, self.transfer.max_retries)
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some("") => home_dir(),
        Some(rest) if rest.starts_with(['/', '\\']) => home_dir().join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("airshare").join("agent.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(home_dir().join(".config").join("airshare").join("agent.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_path, "~/AirShare");
        assert!(config.discovery.enabled);
        assert!(!config.discovery.scan_enabled);
        assert_eq!(config.discovery.mdns_scan_interval_secs, 10);
        assert_eq!(config.discovery.http_scan_interval_secs, 30);
        assert_eq!(config.discovery.http_probe_timeout_ms, 1500);
        assert_eq!(config.discovery.merge_interval_secs, 5);
        assert_eq!(config.discovery.heartbeat_interval_secs, 3);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.transfer.session_ttl(), Duration::from_secs(3600));
        config.validate().unwrap();
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            name: "Laptop".into(),
            port: 9000,
            storage_path: "/srv/share".into(),
            device_type: DeviceType::Tablet,
            discovery: DiscoverySettings {
                scan_enabled: true,
                http_probe_timeout_ms: 800,
                ..DiscoverySettings::default()
            },
            transfer: TransferSettings {
                chunk_size: 1024,
                ..TransferSettings::default()
            },
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.name, "Laptop");
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.device_type, DeviceType::Tablet);
        assert!(parsed.discovery.scan_enabled);
        assert_eq!(parsed.discovery.http_probe_timeout_ms, 800);
        assert_eq!(parsed.transfer.chunk_size, 1024);
        assert_eq!(parsed.storage_dir(), PathBuf::from("/srv/share"));
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
name = "Desk"
device_type = "desktop"

[transfer]
max_retries = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "Desk");
        assert_eq!(config.device_type, DeviceType::Desktop);
        assert_eq!(config.port, 8080);
        assert!(config.discovery.enabled);
        assert_eq!(config.transfer.max_retries, 5);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
    }

    #[test]
    fn settings_map_onto_library_configs() {
        let config = Config::default();
        let multicast = config.discovery.multicast();
        assert_eq!(multicast.scan_interval, Duration::from_secs(10));
        assert_eq!(multicast.offline_cutoff(), Duration::from_secs(30));

        let scan = config.discovery.scan(config.port);
        assert_eq!(scan.port, 8080);
        assert_eq!(scan.probe_timeout, Duration::from_millis(1500));
        assert_eq!(scan.offline_cutoff(), Duration::from_secs(90));

        let engine = config.chunk_engine();
        assert_eq!(engine.chunk_size(), 64 * 1024);
        assert_eq!(engine.max_retries(), 3);
        assert_eq!(config.receiver_config(true).max_file_size, config.transfer.max_file_size);
        assert!(!config.receiver_config(false).purge_stale);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = Config::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.merge_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.cleanup_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        let home = home_dir();
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("~/AirShare"), home.join("AirShare"));
        assert_eq!(expand_home("/data/~x"), PathBuf::from("/data/~x"));
        assert_eq!(expand_home("~other"), PathBuf::from("~other"));
    }

    #[test]
    fn config_path_not_empty() {
        let path = config_path().unwrap();
        assert!(path.to_string_lossy().contains("airshare"));
    }

    #[test]
    fn load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("agent.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.port, 8080);

        let edited = Config {
            name: "SaveTest".into(),
            ..config
        };
        edited.save_to(&path).unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().name, "SaveTest");
    }

    #[test]
    fn load_rejects_invalid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");
        std::fs::write(&path, "port = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
