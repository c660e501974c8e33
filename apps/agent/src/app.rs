//! Application orchestrator: wires the agent components together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use airshare_discovery::{
    Advertisement, Advertiser, BoxError, DiscoveryEvent, DiscoveryManager, DiscoverySource,
    MulticastSource, ScanSource, detect_platform,
};
use airshare_protocol::{DeviceListResponse, FileListResponse};
use airshare_transfer::{Receiver, UploadEvent, Uploader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the agent until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Storage --
    let receiver = Receiver::open(config.receiver_config(true)).await?;
    tracing::info!(storage = %receiver.storage_dir().display(), "storage ready");

    // -- Discovery --
    let manager = if config.discovery.enabled {
        let manager = build_discovery(&config);
        manager.on_event(log_event);
        manager.start()?;
        tracing::info!(
            sources = manager.stats().sources.len(),
            "discovery started"
        );
        Some(manager)
    } else {
        tracing::info!("discovery disabled");
        None
    };

    // -- Advertisement --
    let mut advertiser = Advertiser::new(advertisement(&config))
        .with_heartbeat_interval(config.discovery.heartbeat_interval());
    if config.discovery.enabled {
        match advertiser.start() {
            Ok(()) => advertiser.start_heartbeat(&cancel),
            // Peers can still find us through subnet scans.
            Err(e) => tracing::warn!(error = %e, "advertising unavailable"),
        }
    }

    tracing::info!("agent ready");

    // -- Main loop: wait for shutdown --
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;
    let mut cleanup_tick = tokio::time::interval(config.transfer.cleanup_interval());
    cleanup_tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            _ = stats_tick.tick() => {
                if let Some(manager) = &manager {
                    let stats = manager.stats();
                    tracing::info!(
                        online = stats.online_devices,
                        total = stats.total_devices,
                        transfers = receiver.active_sessions().await.len(),
                        "status"
                    );
                }
            }
            _ = cleanup_tick.tick() => {
                let reaped = receiver.reap(config.transfer.session_ttl()).await;
                if reaped > 0 {
                    tracing::info!(reaped, "cleaned up stale transfers");
                }
            }
        }
    }

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    cancel.cancel();
    advertiser.stop();
    if let Some(manager) = &manager {
        manager.stop().await;
    }
    for session in receiver.active_sessions().await {
        if let Err(e) = receiver.cancel(&session.id).await {
            tracing::warn!(session = %session.id, error = %e, "failed to cancel transfer");
        }
    }

    Ok(())
}

/// Imports `file` into the storage directory through the chunk pipeline,
/// so the stored copy is verified against the source hash.
pub async fn import(config: Config, file: PathBuf) -> anyhow::Result<()> {
    // A running agent may own chunk data in the same directory.
    let receiver = Receiver::open(config.receiver_config(false)).await?;
    let engine = config.chunk_engine();
    let mut session = engine.prepare(&file).await?;
    tracing::info!(
        file = %session.file_name,
        size = session.declared_size,
        chunks = session.total_chunks(),
        "importing"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                UploadEvent::Progress { progress, .. } => {
                    tracing::debug!(
                        chunks = progress.completed_chunks,
                        total = progress.total_chunks,
                        percent = progress.percentage(),
                        "progress"
                    );
                }
                UploadEvent::ChunkFailed { index, retries, error, .. } => {
                    tracing::warn!(index, retries, error = %error, "chunk retry");
                }
                _ => {}
            }
        }
    });

    let result = Uploader::new(&receiver, engine, cancel)
        .with_events(tx)
        .upload(&file, &mut session)
        .await;
    let _ = reporter.await;
    result?;

    let dest = receiver.storage_dir().join(&session.file_name);
    tracing::info!(path = %dest.display(), hash = %session.expected_hash, "import complete");
    println!("{}", dest.display());
    Ok(())
}

/// Listens for peers for `wait` and prints the merged view as JSON.
pub async fn devices(config: Config, wait: Duration) -> anyhow::Result<()> {
    let manager = build_discovery(&config);
    manager.start()?;

    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    manager.merge_now();
    let response = DeviceListResponse {
        devices: manager.online_devices(),
    };
    manager.stop().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Prints the stored files as JSON.
pub fn files(config: &Config) -> anyhow::Result<()> {
    let files = airshare_file_ops::list_files(&config.storage_dir())?;
    println!("{}", serde_json::to_string_pretty(&FileListResponse { files })?);
    Ok(())
}

fn build_discovery(config: &Config) -> DiscoveryManager {
    let mut sources: Vec<Arc<dyn DiscoverySource>> =
        vec![Arc::new(MulticastSource::new(config.discovery.multicast()))];
    if config.discovery.scan_enabled {
        sources.push(Arc::new(ScanSource::new(config.discovery.scan(config.port))));
    }
    DiscoveryManager::new(sources).with_merge_interval(config.discovery.merge_interval())
}

fn advertisement(config: &Config) -> Advertisement {
    Advertisement {
        instance: uuid::Uuid::new_v4().to_string(),
        name: config.name.clone(),
        platform: detect_platform().to_string(),
        device_type: config.device_type,
        port: config.port,
        fingerprint: String::new(),
        ips: vec![],
    }
}

fn log_event(event: DiscoveryEvent) -> Result<(), BoxError> {
    let device = event.device();
    match &event {
        DiscoveryEvent::Added(_) => tracing::info!(
            device = %device.id,
            name = %device.name,
            address = %device.endpoint(),
            platform = %device.platform,
            "peer found"
        ),
        DiscoveryEvent::Updated(_) => tracing::debug!(
            device = %device.id,
            name = %device.name,
            address = %device.endpoint(),
            "peer updated"
        ),
        DiscoveryEvent::Removed(_) => tracing::info!(
            device = %device.id,
            name = %device.name,
            "peer gone"
        ),
    }
    Ok(())
}
