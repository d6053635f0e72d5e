use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::host::TrackerHost;
use crate::protocol::packets::HandshakeData;
use crate::protocol::{FirmwareFeatures, WireProtocol};
use crate::tracker::{Tracker, TrackerCapabilities, TrackerStatus};

/// One logical device and everything the server tracks about it. Records are
///  created on the first handshake from a new hardware identity and live for
///  the rest of the process; a device that reconnects from a different
///  address keeps its record (see the registry's adoption logic).
#[derive(Debug)]
pub struct UdpDevice {
    /// Session-restoration key: the reported MAC, or the peer IP when the
    ///  firmware does not report one. Immutable for the life of the record.
    pub hardware_id: String,
    pub address: SocketAddr,
    pub ip_address: IpAddr,
    pub descriptive_name: String,
    pub name: String,
    pub protocol: WireProtocol,
    pub firmware: String,
    pub firmware_build: u32,
    pub firmware_features: FirmwareFeatures,
    pub board_type: u32,
    pub mcu_type: u32,
    pub last_packet_time: Instant,
    pub last_ping_id: u32,
    pub last_ping_time: Instant,
    pub timed_out: bool,
    pub last_serial_update: Instant,
    pub serial_buffer: String,
    pub last_packet_number: u64,
    pub trackers: FxHashMap<u8, Arc<Tracker>>,
}

impl UdpDevice {
    pub fn new(hardware_id: String, handshake: &HandshakeData, address: SocketAddr) -> UdpDevice {
        let now = Instant::now();
        let mut device = UdpDevice {
            hardware_id,
            address,
            ip_address: address.ip(),
            descriptive_name: String::new(),
            name: String::new(),
            protocol: WireProtocol::SlimevrRaw,
            firmware: String::new(),
            firmware_build: 0,
            firmware_features: FirmwareFeatures::default(),
            // board and MCU identity never change after creation, even
            //  across re-handshakes
            board_type: handshake.board_type,
            mcu_type: handshake.mcu_type,
            last_packet_time: now,
            last_ping_id: 0,
            last_ping_time: now,
            timed_out: false,
            last_serial_update: now,
            serial_buffer: String::new(),
            last_packet_number: 0,
            trackers: FxHashMap::default(),
        };
        device.apply_handshake(handshake, address);
        device
    }

    /// The mutable half of the handshake, applied both when a record is
    ///  created and when an existing record is adopted by a reconnecting
    ///  device.
    pub fn apply_handshake(&mut self, handshake: &HandshakeData, peer: SocketAddr) {
        self.address = peer;
        self.ip_address = peer.ip();
        // single slash: the double-slash form would change the name under
        //  which existing installations persisted their device settings
        self.descriptive_name = format!("udp:/{}", peer.ip());
        self.protocol = if handshake.firmware.is_empty() {
            WireProtocol::OwoLegacy
        } else {
            WireProtocol::SlimevrRaw
        };
        self.firmware = handshake.firmware.clone();
        self.firmware_build = handshake.firmware_build;
        self.name = match &handshake.mac {
            Some(mac) => format!("udp://{}", mac),
            None => self.descriptive_name.clone(),
        };
        self.firmware_features = FirmwareFeatures::default();
        // the device restarted its packet numbering; accept the backward jump
        self.last_packet_number = 0;
        // the handshake itself is proof of life; on adoption it arrives from
        //  an address that does not map to this record yet, so the parse-side
        //  refresh never sees it
        self.last_packet_time = Instant::now();
        self.timed_out = false;
    }

    /// Creates the tracker for a (device, sensor) pair the first time the
    ///  sensor shows up and hands it to the host; on later sightings only the
    ///  reported status is applied.
    pub fn provision_sensor<H: TrackerHost>(
        &mut self,
        host: &H,
        sensor_id: u8,
        sensor_type: u32,
        raw_status: u8,
    ) {
        if let Some(existing) = self.trackers.get(&sensor_id) {
            if let Ok(status) = TrackerStatus::try_from(raw_status) {
                existing.set_status(status);
            }
            return;
        }

        let tracker = Arc::new(Tracker::new(
            host.next_tracker_id(),
            format!("{}/{}", self.name, sensor_id),
            tracker_description(&self.hardware_id),
            TrackerCapabilities {
                rotation: true,
                acceleration: true,
                filtering: true,
                needs_reset: true,
                needs_mounting: true,
                user_editable: true,
                imu_type: sensor_type,
            },
            TrackerStatus::try_from(raw_status).unwrap_or(TrackerStatus::Disconnected),
        ));
        self.trackers.insert(sensor_id, tracker.clone());
        host.tracker_added(tracker);
    }
}

/// A short stable tag for a device, derived from its hardware identity so it
///  survives reconnects and restarts: bytes 3..7 of the SHA-256, folded to
///  five hex characters.
fn tracker_description(hardware_id: &str) -> String {
    let hash = Sha256::digest(hardware_id.as_bytes());
    let tag = u32::from_be_bytes([hash[3], hash[4], hash[5], hash[6]]);
    format!("{:05x}", tag & 0xf_ffff)
}
