//! Presence heartbeat on the multicast group.
//!
//! Every running peer sends a small JSON [`Beacon`] to the group on a fixed
//! interval; listeners turn beacons into sightings so a device stays fresh
//! even between mDNS announcements.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use airshare_protocol::{Beacon, DeviceType};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::DiscoveryError;
use crate::net::is_usable_ipv4;
use crate::types::{Device, SourceKind};

/// Binds a non-blocking socket on `port` that has joined `group`.
///
/// `SO_REUSEADDR` is set so several peers on one host can listen at once.
pub fn bind_listener(group: Ipv4Addr, port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| DiscoveryError::Network(format!("failed to join {group}: {e}")))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Converts a received beacon into a sighting.
///
/// The ID matches the one mDNS produces for the same host (`{ip}-{host}`),
/// so both paths freshen a single record.
pub fn device_from_beacon(beacon: &Beacon, from: IpAddr) -> Option<Device> {
    let IpAddr::V4(v4) = from else {
        return None;
    };
    if !is_usable_ipv4(v4) || beacon.port == 0 {
        return None;
    }

    let mut device = Device::new(
        format!("{v4}-{}", beacon.host),
        from,
        beacon.port,
        SourceKind::Multicast,
    );
    if !beacon.name.is_empty() {
        device.name = beacon.name.clone();
    }
    if !beacon.platform.is_empty() {
        device.platform = beacon.platform.clone();
    }
    if beacon.device_type != DeviceType::Unknown {
        device.device_type = beacon.device_type;
    }
    Some(device)
}

/// Receives beacons until cancelled, handing each valid one to `on_beacon`.
pub async fn listen<F>(socket: UdpSocket, cancel: CancellationToken, mut on_beacon: F)
where
    F: FnMut(Beacon, SocketAddr),
{
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat listener stopped");
                return;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => match Beacon::decode(&buf[..n]) {
                    Some(beacon) => on_beacon(beacon, from),
                    None => trace!(%from, bytes = n, "ignoring foreign datagram"),
                },
                Err(e) => {
                    warn!(error = %e, "heartbeat receive failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}

/// Sends `beacon` to `target` every `interval` until cancelled.
pub async fn announce(
    beacon: Beacon,
    target: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), DiscoveryError> {
    if interval.is_zero() {
        return Err(DiscoveryError::Config("heartbeat interval must be non-zero".into()));
    }
    let payload = beacon
        .encode()
        .map_err(|e| DiscoveryError::Config(format!("invalid beacon: {e}")))?;
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.set_multicast_loop_v4(true)?;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat announcer stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!(%target, error = %e, "failed to send heartbeat");
                }
            }
        }
    }
}
