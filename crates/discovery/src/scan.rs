//! Subnet scan over the HTTP status endpoint.
//!
//! Every interval the source probes each host of every local /24 with
//! `GET /api/status`. Probes run concurrently, each bounded by the probe
//! timeout, and the whole fan-out is bounded by the scan deadline: whatever
//! has not answered by then is aborted.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use airshare_protocol::constants::{DEFAULT_HTTP_PORT, STATUS_PATH};
use airshare_protocol::{DeviceType, StatusResponse};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::DiscoveryError;
use crate::net::{local_ipv4s, subnet_hosts};
use crate::source::{DiscoverySource, RunState};
use crate::store::DeviceStore;
use crate::types::{Device, SourceKind};

/// Configuration for [`ScanSource`].
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Time between scans; devices silent for three intervals go offline.
    pub scan_interval: Duration,
    /// Upper bound for a single probe.
    pub probe_timeout: Duration,
    /// Upper bound for one whole subnet sweep.
    pub scan_deadline: Duration,
    /// Port the status endpoint listens on.
    pub port: u16,
    /// Explicit hosts to probe. Empty means every local /24.
    pub targets: Vec<IpAddr>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(1500),
            scan_deadline: Duration::from_secs(10),
            port: DEFAULT_HTTP_PORT,
            targets: Vec::new(),
        }
    }
}

impl ScanConfig {
    pub fn offline_cutoff(&self) -> Duration {
        self.scan_interval * 3
    }
}

/// Discovers peers by probing the local subnets' status endpoints.
pub struct ScanSource {
    config: ScanConfig,
    store: DeviceStore,
    run: RunState,
}

impl ScanSource {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            store: DeviceStore::new(),
            run: RunState::default(),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }
}

impl DiscoverySource for ScanSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Scan
    }

    fn start(&self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        if self.config.scan_interval.is_zero()
            || self.config.scan_deadline.is_zero()
            || self.config.probe_timeout.is_zero()
        {
            return Err(DiscoveryError::Config(
                "scan interval, deadline and probe timeout must be non-zero".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(self.config.probe_timeout)
            .connect_timeout(self.config.probe_timeout)
            .build()
            .map_err(|e| DiscoveryError::Network(format!("failed to build HTTP client: {e}")))?;

        let token = self.run.begin(&cancel)?;
        tokio::spawn(scan_loop(
            client,
            self.store.clone(),
            self.config.clone(),
            token,
        ));

        info!(
            port = self.config.port,
            interval_secs = self.config.scan_interval.as_secs(),
            "subnet scan discovery started"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.run.is_running() {
            debug!("stopping subnet scan discovery");
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

async fn scan_loop(
    client: reqwest::Client,
    store: DeviceStore,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    // First tick fires immediately so peers show up without waiting an interval.
    let mut ticker = tokio::time::interval(config.scan_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let hosts = scan_targets(&config);
                let found = tokio::select! {
                    _ = cancel.cancelled() => break,
                    found = scan_once(&client, hosts, config.port, config.probe_timeout, config.scan_deadline) => found,
                };

                for device in found {
                    let id = device.id.clone();
                    if store.upsert(device) {
                        info!(device = %id, "discovered device via subnet scan");
                    }
                }

                let sweep = store.sweep(config.offline_cutoff(), Utc::now());
                for device in sweep.marked_offline.iter().chain(&sweep.removed) {
                    debug!(device = %device.id, status = ?device.status, "scan device expired");
                }
            }
        }
    }

    debug!("subnet scan loop stopped");
}

/// Hosts to probe this round: explicit targets, or every other host on each
/// local /24.
fn scan_targets(config: &ScanConfig) -> Vec<IpAddr> {
    if !config.targets.is_empty() {
        return config.targets.clone();
    }

    let local = local_ipv4s();
    if local.is_empty() {
        debug!("no usable IPv4 interface, skipping subnet scan");
    }

    let own: HashSet<_> = local.iter().copied().collect();
    let mut seen = HashSet::new();
    local
        .iter()
        .flat_map(|ip| subnet_hosts(*ip))
        .filter(|host| !own.contains(host) && seen.insert(*host))
        .map(IpAddr::V4)
        .collect()
}

/// Probes `hosts` concurrently and returns the ones that answered in time.
pub(crate) async fn scan_once(
    client: &reqwest::Client,
    hosts: Vec<IpAddr>,
    port: u16,
    probe_timeout: Duration,
    deadline: Duration,
) -> Vec<Device> {
    let total = hosts.len();
    let mut probes = JoinSet::new();
    for ip in hosts {
        let client = client.clone();
        probes.spawn(async move {
            tokio::time::timeout(probe_timeout, probe(&client, ip, port))
                .await
                .ok()
                .flatten()
        });
    }

    let mut found = Vec::new();
    let collected = tokio::time::timeout(deadline, async {
        while let Some(result) = probes.join_next().await {
            if let Ok(Some(device)) = result {
                found.push(device);
            }
        }
    })
    .await;

    if collected.is_err() {
        debug!(
            outstanding = probes.len(),
            "scan deadline reached, abandoning outstanding probes"
        );
        probes.abort_all();
    }

    trace!(probed = total, answered = found.len(), "subnet scan finished");
    found
}

async fn probe(client: &reqwest::Client, ip: IpAddr, port: u16) -> Option<Device> {
    let url = format!("http://{}{STATUS_PATH}", SocketAddr::new(ip, port));
    let response = client.get(&url).send().await.ok()?;
    if response.status() != reqwest::StatusCode::OK {
        trace!(%url, status = %response.status(), "probe rejected");
        return None;
    }
    let status = response
        .json::<StatusResponse>()
        .await
        .unwrap_or_default();
    Some(device_from_status(ip, port, status))
}

fn device_from_status(ip: IpAddr, port: u16, status: StatusResponse) -> Device {
    let mut device = Device::new(format!("http-{ip}"), ip, port, SourceKind::Scan);
    if !status.name.trim().is_empty() {
        device.name = status.name;
    }
    if !status.platform.trim().is_empty() {
        device.platform = status.platform;
    }
    if status.device_type != DeviceType::Unknown {
        device.device_type = status.device_type;
    }
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response per connection.
    async fn serve(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    /// Accepts connections and never answers.
    async fn serve_silence() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().build().unwrap()
    }

    fn localhost() -> Vec<IpAddr> {
        vec!["127.0.0.1".parse().unwrap()]
    }

    #[tokio::test]
    async fn probe_reads_status_body() {
        let body = r#"{"name":"Den PC","platform":"Windows","deviceType":"desktop"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let port = serve(response).await;

        let found = scan_once(
            &client(),
            localhost(),
            port,
            Duration::from_secs(2),
            Duration::from_secs(3),
        )
        .await;
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.id, "http-127.0.0.1");
        assert_eq!(d.name, "Den PC");
        assert_eq!(d.platform, "Windows");
        assert_eq!(d.device_type, DeviceType::Desktop);
        assert_eq!(d.source, SourceKind::Scan);
    }

    #[tokio::test]
    async fn plain_ok_yields_placeholder_device() {
        let port = serve(
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
        )
        .await;
        let found = scan_once(
            &client(),
            localhost(),
            port,
            Duration::from_secs(2),
            Duration::from_secs(3),
        )
        .await;
        assert_eq!(found.len(), 1);
        assert!(found[0].has_default_name());
        assert_eq!(found[0].completeness(), 0);
    }

    #[tokio::test]
    async fn non_200_is_not_a_device() {
        let port = serve(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let found = scan_once(
            &client(),
            localhost(),
            port,
            Duration::from_secs(2),
            Duration::from_secs(3),
        )
        .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn hung_probes_are_abandoned_at_the_deadline() {
        let port = serve_silence().await;
        let started = std::time::Instant::now();
        let found = scan_once(
            &client(),
            localhost(),
            port,
            Duration::from_secs(30),
            Duration::from_millis(200),
        )
        .await;
        assert!(found.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn explicit_targets_override_subnets() {
        let config = ScanConfig {
            targets: localhost(),
            ..ScanConfig::default()
        };
        assert_eq!(scan_targets(&config), localhost());
    }

    #[test]
    fn subnet_targets_exclude_own_addresses() {
        let local = local_ipv4s();
        let targets = scan_targets(&ScanConfig::default());
        for ip in local {
            assert!(!targets.contains(&IpAddr::V4(ip)));
        }
    }

    #[test]
    fn start_rejects_zero_deadline() {
        let source = ScanSource::new(ScanConfig {
            scan_deadline: Duration::ZERO,
            ..ScanConfig::default()
        });
        assert!(matches!(
            source.start(CancellationToken::new()),
            Err(DiscoveryError::Config(_))
        ));
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn zero_scan_interval_is_rejected() {
        let source = ScanSource::new(ScanConfig {
            scan_interval: Duration::ZERO,
            ..Default::default()
        });
        let err = source.start(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));
        assert!(!source.is_running());
    }
}
