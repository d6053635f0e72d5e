pub mod device;
pub mod discovery;
pub mod dispatch;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::host::TrackerHost;
use crate::protocol::{codec, MAX_DATAGRAM_SIZE};
use crate::server::registry::ConnectionRegistry;
use crate::tracker::TrackerStatus;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound on how long the loop blocks in `recv`; this is what keeps
    ///  the timed duties responsive.
    pub receive_timeout: Duration,
    pub keepalive_interval: Duration,
    pub ping_interval: Duration,
    pub discovery_interval: Duration,
    /// Silence longer than this marks a device's trackers disconnected.
    pub timeout_after: Duration,
    /// Buffered serial text older than this is flushed to the console even
    ///  without a newline.
    pub serial_flush_after: Duration,
}

impl ServerConfig {
    pub fn new(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            receive_timeout: Duration::from_millis(250),
            keepalive_interval: Duration::from_millis(500),
            ping_interval: Duration::from_millis(500),
            discovery_interval: Duration::from_millis(2000),
            timeout_after: Duration::from_millis(1000),
            serial_flush_after: Duration::from_millis(500),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new(6969)
    }
}

/// The seam between the event loop and the socket, so that tests can observe
///  outbound traffic without real networking.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;
}

pub struct UdpSender {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl DatagramSender for UdpSender {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }
}

/// Transport errors are not fatal to the loop; they are logged and the duty
///  cycle moves on.
pub(crate) async fn send_logged<S: DatagramSender>(sender: &S, to: SocketAddr, buf: &[u8]) {
    if let Err(e) = sender.send(to, buf).await {
        warn!("error sending packet to {}: {}", to, e);
    }
}

/// The UDP tracker server. One task runs [TrackerServer::run]; everything
///  else observes through the registry handle and the [TrackerHost]
///  callbacks.
pub struct TrackerServer<H: TrackerHost> {
    config: ServerConfig,
    registry: Arc<RwLock<ConnectionRegistry>>,
    host: Arc<H>,
    socket: Arc<UdpSocket>,
    pub(crate) broadcast_targets: Vec<SocketAddr>,
}

impl<H: TrackerHost> TrackerServer<H> {
    /// Binds the socket and computes the discovery broadcast set. The server
    ///  does nothing until [TrackerServer::run] is awaited.
    pub async fn new(config: ServerConfig, host: Arc<H>) -> anyhow::Result<TrackerServer<H>> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
        socket.set_broadcast(true)?;
        let broadcast_targets = discovery::broadcast_targets(config.port);

        Ok(TrackerServer {
            config,
            registry: Arc::new(RwLock::new(ConnectionRegistry::new())),
            host,
            socket: Arc::new(socket),
            broadcast_targets,
        })
    }

    /// Handle for the application to enumerate devices and trackers. Reads
    ///  are snapshots: the event loop is the only writer.
    pub fn registry(&self) -> Arc<RwLock<ConnectionRegistry>> {
        self.registry.clone()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The event loop: discovery, bounded receive, and the keepalive sweep,
    ///  forever and in that order. Cancel by dropping the future; the socket
    ///  is released with it.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(port = self.config.port, "listening for trackers");

        let sender = UdpSender {
            socket: self.socket.clone(),
        };
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut send_buf = BytesMut::new();
        let mut last_discovery = Instant::now();
        let mut last_sweep = Instant::now();

        loop {
            if last_discovery.elapsed() >= self.config.discovery_interval {
                let sent =
                    do_discovery(&self.registry, &self.broadcast_targets, &sender, &mut send_buf)
                        .await;
                if sent {
                    last_discovery = Instant::now();
                }
            }

            match time::timeout(self.config.receive_timeout, self.socket.recv_from(&mut recv_buf))
                .await
            {
                Err(_) => {
                    // receive timeout: expected, move on to the timed duties
                }
                Ok(Err(e)) => {
                    warn!("error receiving datagram: {}", e);
                }
                Ok(Ok((len, from))) => {
                    dispatch::on_datagram(
                        &self.registry,
                        self.host.as_ref(),
                        &sender,
                        &mut send_buf,
                        &recv_buf[..len],
                        from,
                    )
                    .await;
                }
            }

            if last_sweep.elapsed() >= self.config.keepalive_interval {
                last_sweep = Instant::now();
                do_keepalive_sweep(
                    &self.registry,
                    &self.config,
                    self.host.as_ref(),
                    &sender,
                    &mut send_buf,
                )
                .await;
            }
        }
    }
}

/// Broadcasts a discovery heartbeat while no sensor has been provisioned
///  yet. Returns whether the duty ran, so the caller can restart the
///  cadence from the actual send.
pub(crate) async fn do_discovery<S: DatagramSender>(
    registry: &RwLock<ConnectionRegistry>,
    targets: &[SocketAddr],
    sender: &S,
    send_buf: &mut BytesMut,
) -> bool {
    if registry.read().await.has_any_sensors() {
        return false;
    }

    codec::write_discovery(send_buf);
    for target in targets {
        send_logged(sender, *target, send_buf).await;
    }
    debug!(targets = targets.len(), "discovery heartbeat broadcast");
    true
}

/// Walks every device once: keepalive heartbeat, liveness bookkeeping,
///  stale-serial flush, and the RTT ping. All registry mutation happens
///  under one write acquisition; the actual sends go out after it is
///  released.
pub(crate) async fn do_keepalive_sweep<H: TrackerHost, S: DatagramSender>(
    registry: &RwLock<ConnectionRegistry>,
    config: &ServerConfig,
    host: &H,
    sender: &S,
    send_buf: &mut BytesMut,
) {
    let now = Instant::now();
    let mut outgoing: Vec<(SocketAddr, bytes::Bytes)> = Vec::new();
    let mut console: Vec<String> = Vec::new();

    {
        let mut reg = registry.write().await;
        for device in reg.devices_mut() {
            codec::write_keepalive(send_buf);
            outgoing.push((device.address, send_buf.split().freeze()));

            if now.duration_since(device.last_packet_time) > config.timeout_after {
                if !device.timed_out {
                    device.timed_out = true;
                    warn!(name = %device.name, "device timed out");
                }
                for tracker in device.trackers.values() {
                    tracker.set_status(TrackerStatus::Disconnected);
                }
            } else {
                device.timed_out = false;
                for tracker in device.trackers.values() {
                    if tracker.status() == TrackerStatus::Disconnected {
                        tracker.set_status(TrackerStatus::Ok);
                    }
                }
            }

            if !device.serial_buffer.is_empty()
                && now.duration_since(device.last_serial_update) > config.serial_flush_after
            {
                console.push(format!("[{}] {}", device.name, device.serial_buffer));
                device.serial_buffer.clear();
            }

            if now.duration_since(device.last_ping_time) > config.ping_interval {
                device.last_ping_id = rand::thread_rng().next_u32();
                device.last_ping_time = now;
                codec::write_ping(send_buf, device.last_ping_id);
                outgoing.push((device.address, send_buf.split().freeze()));
            }
        }
    }

    for (to, buf) in outgoing {
        send_logged(sender, to, &buf).await;
    }
    for line in console {
        host.console_line(&line);
    }
}
