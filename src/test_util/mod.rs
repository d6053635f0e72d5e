use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;

use crate::host::{ResetKind, TrackerHost};
use crate::protocol::packets::{HandshakeData, Packet};
use crate::protocol::MacAddress;
use crate::server::device::UdpDevice;
use crate::server::DatagramSender;
use crate::tracker::Tracker;

/// Convenience for unit tests: the same number always yields the same
///  address, different numbers different addresses.
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10000 + number).into()
}

pub fn test_handshake(mac: Option<[u8; 6]>, firmware: &str, firmware_build: u32) -> HandshakeData {
    HandshakeData {
        board_type: 4,
        imu_type: 2,
        mcu_type: 1,
        firmware_build,
        firmware: firmware.to_string(),
        mac: mac.and_then(MacAddress::from_bytes),
    }
}

/// A standalone device record, for tests below the registry level. `number`
///  must not be zero (an all-zero MAC means "not reported").
pub fn test_device(number: u16) -> UdpDevice {
    let mac = [number as u8; 6];
    let handshake = test_handshake(Some(mac), "0.5.3", 17);
    UdpDevice::new(MacAddress(mac).to_string(), &handshake, test_addr(number))
}

/// The device-side encoding of a packet, as one datagram.
pub fn encode_datagram(packet: &Packet, packet_number: u64) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packet.ser(&mut buf, packet_number);
    buf.to_vec()
}

/// First field of any outbound datagram in the raw framing.
pub fn packet_kind(data: &[u8]) -> u32 {
    u32::from_be_bytes(data[0..4].try_into().expect("datagram shorter than a kind"))
}

/// A [DatagramSender] that records instead of sending.
#[derive(Debug, Default)]
pub struct TrackingSender {
    sent: tokio::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl TrackingSender {
    pub fn new() -> TrackingSender {
        Default::default()
    }

    pub async fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    pub async fn assert_nothing_sent(&self) {
        assert!(self.sent.lock().await.is_empty());
    }
}

#[async_trait]
impl DatagramSender for TrackingSender {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().await.push((to, buf.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResetEvent {
    Started(ResetKind),
    Full(String),
    Yaw(String),
    Mounting(String),
}

/// A [TrackerHost] that records every interaction and allocates sequential
///  tracker ids.
#[derive(Debug, Default)]
pub struct RecordingHost {
    next_id: AtomicU32,
    trackers: Mutex<Vec<Arc<Tracker>>>,
    console: Mutex<Vec<String>>,
    resets: Mutex<Vec<ResetEvent>>,
}

impl RecordingHost {
    pub fn new() -> RecordingHost {
        Default::default()
    }

    pub fn added_trackers(&self) -> Vec<Arc<Tracker>> {
        self.trackers.lock().expect("lock poisoned").clone()
    }

    pub fn console_lines(&self) -> Vec<String> {
        self.console.lock().expect("lock poisoned").clone()
    }

    pub fn reset_events(&self) -> Vec<ResetEvent> {
        self.resets.lock().expect("lock poisoned").clone()
    }
}

impl TrackerHost for RecordingHost {
    fn next_tracker_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn tracker_added(&self, tracker: Arc<Tracker>) {
        self.trackers.lock().expect("lock poisoned").push(tracker);
    }

    fn console_line(&self, line: &str) {
        self.console.lock().expect("lock poisoned").push(line.to_string());
    }

    fn reset_started(&self, kind: ResetKind) {
        self.resets
            .lock()
            .expect("lock poisoned")
            .push(ResetEvent::Started(kind));
    }

    fn reset_full(&self, source: &str) {
        self.resets
            .lock()
            .expect("lock poisoned")
            .push(ResetEvent::Full(source.to_string()));
    }

    fn reset_yaw(&self, source: &str) {
        self.resets
            .lock()
            .expect("lock poisoned")
            .push(ResetEvent::Yaw(source.to_string()));
    }

    fn reset_mounting(&self, source: &str) {
        self.resets
            .lock()
            .expect("lock poisoned")
            .push(ResetEvent::Mounting(source.to_string()));
    }
}
