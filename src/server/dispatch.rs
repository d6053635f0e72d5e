use std::net::SocketAddr;

use bytes::BytesMut;
use nalgebra::{UnitQuaternion, Vector3};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::host::{ResetKind, TrackerHost};
use crate::protocol::packets::{HandshakeData, Packet};
use crate::protocol::{
    codec, server_features, WireProtocol, DATA_TYPE_CORRECTION, DATA_TYPE_NORMAL,
};
use crate::server::registry::ConnectionRegistry;
use crate::server::{send_logged, DatagramSender};
use crate::tracker::TrackerStatus;
use crate::util::hex::hex_dump;

/// Devices report orientation in their sensor frame; this constant rotation
///  aligns it with the application's world frame and is applied on the left
///  of every incoming quaternion.
pub fn axes_offset() -> UnitQuaternion<f32> {
    UnitQuaternion::from_scaled_axis(Vector3::new(-std::f32::consts::FRAC_PI_2, 0.0, 0.0))
}

/// Parses one received datagram and applies every packet it carries.
pub(crate) async fn on_datagram<H: TrackerHost, S: DatagramSender>(
    registry: &RwLock<ConnectionRegistry>,
    host: &H,
    sender: &S,
    send_buf: &mut BytesMut,
    data: &[u8],
    from: SocketAddr,
) {
    let packets = {
        let mut reg = registry.write().await;
        let device = reg.device_mut_by_address(from);
        match codec::parse(data, device) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("failed to parse datagram from {}: {}\n{}", from, e, hex_dump(data));
                return;
            }
        }
    };

    for packet in packets {
        dispatch_packet(registry, host, sender, send_buf, packet, from).await;
    }
}

/// Maps one parsed packet to its effect on the registry, the trackers, and
///  the outbound socket. Packets other than handshakes that arrive without a
///  device mapping are dropped without logging - discovery echoes would make
///  that log line pure noise.
pub(crate) async fn dispatch_packet<H: TrackerHost, S: DatagramSender>(
    registry: &RwLock<ConnectionRegistry>,
    host: &H,
    sender: &S,
    send_buf: &mut BytesMut,
    packet: Packet,
    from: SocketAddr,
) {
    if !matches!(packet, Packet::Handshake(_))
        && registry.read().await.device_by_address(from).is_none()
    {
        return;
    }

    match packet {
        Packet::Heartbeat => {
            // receiving it already refreshed liveness
        }
        Packet::Handshake(handshake) => {
            on_handshake(registry, host, sender, send_buf, handshake, from).await;
        }
        Packet::Rotation { rotation } => {
            // the legacy packet predates multi-sensor firmware
            apply_rotation(registry, from, 0, rotation).await;
        }
        Packet::RotationData {
            sensor_id,
            data_type,
            rotation,
            ..
        } => match data_type {
            DATA_TYPE_NORMAL => apply_rotation(registry, from, sensor_id, rotation).await,
            DATA_TYPE_CORRECTION => {
                // reserved: parsed but deliberately not applied
            }
            _ => {}
        },
        Packet::MagnetometerAccuracy { .. } => {}
        Packet::Acceleration { vector, sensor_id } => {
            let tracker = registry
                .read()
                .await
                .device_by_address(from)
                .and_then(|d| d.trackers.get(&sensor_id).cloned());
            if let Some(tracker) = tracker {
                // the device's x and y axes are swapped relative to the world frame
                tracker.set_acceleration(Vector3::new(vector.y, vector.x, vector.z));
            }
        }
        Packet::PingPong { ping_id } => {
            on_ping_response(registry, ping_id, from).await;
        }
        Packet::Serial { line } => {
            let name = registry
                .read()
                .await
                .device_by_address(from)
                .map(|d| d.name.clone());
            if let Some(name) = name {
                host.console_line(&format!("[{}] {}", name, line));
            }
        }
        Packet::Battery { voltage, level } => {
            let trackers = trackers_of(registry, from).await;
            for tracker in trackers {
                // devices report a 0..1 fraction, the application wants percent
                tracker.set_battery(voltage, level * 100.0);
            }
        }
        Packet::Tap { sensor_id, tap } => {
            info!(peer = %from, sensor_id, tap, "tap registered");
        }
        Packet::Error { sensor_id, error_code } => {
            error!(peer = %from, sensor_id, error_code, "device reported an error");
            let tracker = registry
                .read()
                .await
                .device_by_address(from)
                .and_then(|d| d.trackers.get(&sensor_id).cloned());
            if let Some(tracker) = tracker {
                tracker.set_status(TrackerStatus::Error);
            }
        }
        Packet::SensorInfo {
            sensor_id,
            sensor_status,
            sensor_type,
        } => {
            let ack_to = {
                let mut reg = registry.write().await;
                match reg.device_mut_by_address(from) {
                    Some(device) => {
                        device.provision_sensor(host, sensor_id, sensor_type as u32, sensor_status);
                        debug!(peer = %from, sensor_id, sensor_type, sensor_status, "sensor info");
                        Some(device.address)
                    }
                    None => None,
                }
            };
            if let Some(to) = ack_to {
                codec::write_sensor_info_response(send_buf, sensor_id, sensor_status);
                send_logged(sender, to, send_buf).await;
            }
        }
        Packet::SignalStrength {
            sensor_id: _,
            signal_strength,
        } => {
            let trackers = trackers_of(registry, from).await;
            for tracker in trackers {
                tracker.set_signal_strength(signal_strength);
            }
        }
        Packet::Temperature {
            sensor_id,
            temperature,
        } => {
            let tracker = registry
                .read()
                .await
                .device_by_address(from)
                .and_then(|d| d.trackers.get(&sensor_id).cloned());
            if let Some(tracker) = tracker {
                tracker.set_temperature(temperature);
            }
        }
        Packet::UserAction { action } => match ResetKind::try_from(action) {
            Ok(kind) => {
                info!(peer = %from, %kind, "reset requested by device");
                host.reset_started(kind);
                match kind {
                    ResetKind::Full => host.reset_full("TrackerServer"),
                    ResetKind::Yaw => host.reset_yaw("TrackerServer"),
                    ResetKind::Mounting => host.reset_mounting("TrackerServer"),
                }
            }
            Err(_) => {
                debug!(peer = %from, action, "ignoring unknown user action");
            }
        },
        Packet::FeatureFlags(flags) => {
            let to = registry
                .read()
                .await
                .device_by_address(from)
                .map(|d| d.address);
            if let Some(to) = to {
                codec::write_feature_flags_response(send_buf, &server_features());
                send_logged(sender, to, send_buf).await;

                let mut reg = registry.write().await;
                if let Some(device) = reg.device_mut_by_address(from) {
                    device.firmware_features = flags;
                }
            }
        }
    }
}

async fn on_handshake<H: TrackerHost, S: DatagramSender>(
    registry: &RwLock<ConnectionRegistry>,
    host: &H,
    sender: &S,
    send_buf: &mut BytesMut,
    handshake: HandshakeData,
    from: SocketAddr,
) {
    if handshake.mac.is_none() {
        warn!(
            peer = %from,
            "handshake without a MAC address: the session is keyed on the IP and will not survive the device roaming"
        );
    }

    let response_to = {
        let mut reg = registry.write().await;
        let (index, adopted) = reg.find_or_adopt(&handshake, from);
        let device = reg
            .device_mut(index)
            .expect("find_or_adopt returned a valid index");

        if device.protocol == WireProtocol::OwoLegacy || handshake.firmware_build < 9 {
            // firmware this old never sends sensor info; its one sensor is implicit
            device.provision_sensor(host, 0, handshake.imu_type, 1);
        }

        if adopted {
            info!(
                connection = index,
                board = handshake.board_type,
                imu = handshake.imu_type,
                firmware = %device.firmware,
                mac = ?handshake.mac,
                name = %device.name,
                "device session restored"
            );
        } else {
            info!(
                connection = index,
                board = handshake.board_type,
                imu = handshake.imu_type,
                firmware = %device.firmware,
                mac = ?handshake.mac,
                name = %device.name,
                "new device connected"
            );
        }
        device.address
    };

    codec::write_handshake_response(send_buf);
    send_logged(sender, response_to, send_buf).await;
}

async fn apply_rotation(
    registry: &RwLock<ConnectionRegistry>,
    from: SocketAddr,
    sensor_id: u8,
    rotation: UnitQuaternion<f32>,
) {
    let tracker = registry
        .read()
        .await
        .device_by_address(from)
        .and_then(|d| d.trackers.get(&sensor_id).cloned());
    if let Some(tracker) = tracker {
        tracker.set_rotation(axes_offset() * rotation);
        tracker.data_tick();
    }
}

async fn on_ping_response(
    registry: &RwLock<ConnectionRegistry>,
    ping_id: u32,
    from: SocketAddr,
) {
    let matched = {
        let reg = registry.read().await;
        match reg.device_by_address(from) {
            Some(device) if device.last_ping_id == ping_id => {
                let rtt = Instant::now().duration_since(device.last_ping_time);
                Some((rtt, device.trackers.values().cloned().collect::<Vec<_>>()))
            }
            Some(device) => {
                debug!(
                    peer = %from,
                    expected = device.last_ping_id,
                    received = ping_id,
                    "ignoring ping response with a stale nonce"
                );
                None
            }
            None => None,
        }
    };

    if let Some((rtt, trackers)) = matched {
        let ping_ms = (rtt.as_millis() / 2) as u32;
        for tracker in trackers {
            tracker.set_ping(ping_ms);
            tracker.data_tick();
        }
    }
}

async fn trackers_of(
    registry: &RwLock<ConnectionRegistry>,
    from: SocketAddr,
) -> Vec<std::sync::Arc<crate::tracker::Tracker>> {
    registry
        .read()
        .await
        .device_by_address(from)
        .map(|d| d.trackers.values().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::time;

    use crate::protocol::packets::Packet;
    use crate::protocol::{MacAddress, HANDSHAKE_GREETING, KIND_FEATURE_FLAGS};
    use crate::protocol::FirmwareFeatures;
    use crate::test_util::*;

    async fn registry_with_sensors(sensor_count: u8) -> (RwLock<ConnectionRegistry>, RecordingHost) {
        let registry = RwLock::new(ConnectionRegistry::new());
        let host = RecordingHost::new();
        {
            let mut reg = registry.write().await;
            let (index, _) =
                reg.find_or_adopt(&test_handshake(Some([1; 6]), "0.5.3", 17), test_addr(1));
            for sensor_id in 0..sensor_count {
                reg.device_mut(index)
                    .unwrap()
                    .provision_sensor(&host, sensor_id, 2, 1);
            }
        }
        (registry, host)
    }

    async fn tracker_at(
        registry: &RwLock<ConnectionRegistry>,
        sensor_id: u8,
    ) -> std::sync::Arc<crate::tracker::Tracker> {
        registry
            .read()
            .await
            .device(0)
            .unwrap()
            .trackers
            .get(&sensor_id)
            .unwrap()
            .clone()
    }

    async fn deliver(
        registry: &RwLock<ConnectionRegistry>,
        host: &RecordingHost,
        sender: &TrackingSender,
        packet: &Packet,
        packet_number: u64,
        from: std::net::SocketAddr,
    ) {
        let data = encode_datagram(packet, packet_number);
        on_datagram(registry, host, sender, &mut BytesMut::new(), &data, from).await;
    }

    #[tokio::test]
    async fn test_handshake_creates_device_and_responds() {
        let registry = RwLock::new(ConnectionRegistry::new());
        let host = RecordingHost::new();
        let sender = TrackingSender::new();
        let from: SocketAddr = "10.0.0.5:4567".parse().unwrap();

        let handshake = Packet::Handshake(crate::protocol::packets::HandshakeData {
            board_type: 4,
            imu_type: 2,
            mcu_type: 1,
            firmware_build: 7,
            firmware: String::new(),
            mac: Some(MacAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])),
        });
        deliver(&registry, &host, &sender, &handshake, 1, from).await;

        {
            let reg = registry.read().await;
            let device = reg.device_by_address(from).unwrap();
            assert_eq!(device.hardware_id, "AA:BB:CC:DD:EE:FF");
            assert_eq!(device.protocol, WireProtocol::OwoLegacy);
            // firmware this old gets its single sensor provisioned right away
            let tracker = device.trackers.get(&0).unwrap();
            assert_eq!(tracker.capabilities.imu_type, 2);
            assert_eq!(tracker.status(), TrackerStatus::Ok);
        }
        assert_eq!(host.added_trackers().len(), 1);

        let sent = sender.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, from);
        assert_eq!(sent[0].1[0], 3);
        assert_eq!(&sent[0].1[1..], HANDSHAKE_GREETING);
    }

    #[rstest]
    #[case::legacy_build_0("", 0, true)]
    #[case::legacy_build_7("", 7, true)]
    #[case::old_modern_firmware("0.5.3", 8, true)]
    #[case::modern_build_9("0.5.3", 9, false)]
    #[case::modern_build_17("0.5.3", 17, false)]
    #[tokio::test]
    async fn test_handshake_auto_sensor_cutoff(
        #[case] firmware: &str,
        #[case] build: u32,
        #[case] auto_provisioned: bool,
    ) {
        let registry = RwLock::new(ConnectionRegistry::new());
        let host = RecordingHost::new();
        let sender = TrackingSender::new();

        let handshake = Packet::Handshake(test_handshake(Some([1; 6]), firmware, build));
        deliver(&registry, &host, &sender, &handshake, 1, test_addr(1)).await;

        let reg = registry.read().await;
        assert_eq!(
            reg.device(0).unwrap().trackers.contains_key(&0),
            auto_provisioned
        );
    }

    #[tokio::test]
    async fn test_session_migration() {
        let registry = RwLock::new(ConnectionRegistry::new());
        let host = RecordingHost::new();
        let sender = TrackingSender::new();
        let old_addr: SocketAddr = "10.0.0.5:4567".parse().unwrap();
        let new_addr: SocketAddr = "10.0.0.6:4567".parse().unwrap();

        let handshake = Packet::Handshake(test_handshake(Some([1; 6]), "", 7));
        deliver(&registry, &host, &sender, &handshake, 1, old_addr).await;
        sender.take_sent().await;

        deliver(&registry, &host, &sender, &handshake, 1, new_addr).await;

        let reg = registry.read().await;
        assert_eq!(reg.len(), 1);
        assert!(reg.device_by_address(old_addr).is_none());
        let device = reg.device_by_address(new_addr).unwrap();
        assert_eq!(device.hardware_id, "01:01:01:01:01:01");
        assert_eq!(reg.connection_index("01:01:01:01:01:01"), Some(0));
        // the tracker from before the migration is still there, not re-provisioned
        assert_eq!(device.trackers.len(), 1);
        assert_eq!(host.added_trackers().len(), 1);
        drop(reg);

        let sent = sender.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, new_addr);
    }

    #[tokio::test]
    async fn test_rotation_data_applies_axes_offset() {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();
        let tracker = tracker_at(&registry, 0).await;

        let packet = Packet::RotationData {
            sensor_id: 0,
            data_type: DATA_TYPE_NORMAL,
            rotation: UnitQuaternion::identity(),
            accuracy_info: 0,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker.rotation(), axes_offset());
        assert_eq!(tracker.data_ticks(), 1);
    }

    #[rstest]
    #[case::correction(DATA_TYPE_CORRECTION)]
    #[case::unknown(7)]
    #[tokio::test]
    async fn test_rotation_data_other_types_leave_state_unchanged(#[case] data_type: u8) {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();
        let tracker = tracker_at(&registry, 0).await;

        let packet = Packet::RotationData {
            sensor_id: 0,
            data_type,
            rotation: UnitQuaternion::from_scaled_axis(nalgebra::Vector3::new(0.0, 1.0, 0.0)),
            accuracy_info: 0,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker.rotation(), UnitQuaternion::identity());
        assert_eq!(tracker.data_ticks(), 0);
    }

    #[tokio::test]
    async fn test_legacy_rotation_goes_to_sensor_zero() {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();
        let tracker = tracker_at(&registry, 0).await;

        let packet = Packet::Rotation {
            rotation: UnitQuaternion::identity(),
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker.rotation(), axes_offset());
        assert_eq!(tracker.data_ticks(), 1);
    }

    #[tokio::test]
    async fn test_rotation_for_unknown_sensor_is_dropped() {
        let (registry, host) = registry_with_sensors(0).await;
        let sender = TrackingSender::new();

        let packet = Packet::Rotation {
            rotation: UnitQuaternion::identity(),
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        // no tracker appeared out of nowhere
        assert!(registry.read().await.device(0).unwrap().trackers.is_empty());
    }

    #[tokio::test]
    async fn test_acceleration_axis_remap() {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();
        let tracker = tracker_at(&registry, 0).await;

        let packet = Packet::Acceleration {
            vector: nalgebra::Vector3::new(1.0, 2.0, 3.0),
            sensor_id: 0,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker.acceleration(), nalgebra::Vector3::new(2.0, 1.0, 3.0));
        // acceleration does not drive the data clock
        assert_eq!(tracker.data_ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_round_trip_time() {
        let (registry, host) = registry_with_sensors(2).await;
        let sender = TrackingSender::new();

        {
            let mut reg = registry.write().await;
            let device = reg.device_mut(0).unwrap();
            device.last_ping_id = 42;
            device.last_ping_time = Instant::now();
        }
        time::advance(Duration::from_millis(80)).await;

        deliver(&registry, &host, &sender, &Packet::PingPong { ping_id: 42 }, 1, test_addr(1))
            .await;

        for sensor_id in [0, 1] {
            let tracker = tracker_at(&registry, sensor_id).await;
            assert_eq!(tracker.ping_ms(), 40);
            assert_eq!(tracker.data_ticks(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_with_stale_nonce_is_dropped() {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();
        let tracker = tracker_at(&registry, 0).await;

        {
            let mut reg = registry.write().await;
            let device = reg.device_mut(0).unwrap();
            device.last_ping_id = 42;
            device.last_ping_time = Instant::now();
        }
        time::advance(Duration::from_millis(80)).await;

        deliver(&registry, &host, &sender, &Packet::PingPong { ping_id: 43 }, 1, test_addr(1))
            .await;

        assert_eq!(tracker.ping_ms(), 0);
        assert_eq!(tracker.data_ticks(), 0);
    }

    #[tokio::test]
    async fn test_serial_line_reaches_the_console() {
        let (registry, host) = registry_with_sensors(0).await;
        let sender = TrackingSender::new();

        let packet = Packet::Serial {
            line: "boot complete\n".to_string(),
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(
            host.console_lines(),
            vec!["[udp://01:01:01:01:01:01] boot complete".to_string()]
        );
    }

    #[tokio::test]
    async fn test_battery_level_is_normalized_to_percent() {
        let (registry, host) = registry_with_sensors(2).await;
        let sender = TrackingSender::new();

        let packet = Packet::Battery {
            voltage: 3.7,
            level: 0.83,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        for sensor_id in [0, 1] {
            let state = tracker_at(&registry, sensor_id).await.snapshot();
            assert_eq!(state.battery_voltage, 3.7);
            assert!((state.battery_level - 83.0).abs() < 1e-3);
        }
    }

    #[tokio::test]
    async fn test_error_packet_marks_tracker() {
        let (registry, host) = registry_with_sensors(2).await;
        let sender = TrackingSender::new();

        let packet = Packet::Error {
            sensor_id: 1,
            error_code: 9,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker_at(&registry, 0).await.status(), TrackerStatus::Ok);
        assert_eq!(tracker_at(&registry, 1).await.status(), TrackerStatus::Error);
    }

    #[tokio::test]
    async fn test_sensor_info_provisions_and_acks() {
        let (registry, host) = registry_with_sensors(0).await;
        let sender = TrackingSender::new();

        let packet = Packet::SensorInfo {
            sensor_id: 1,
            sensor_status: 1,
            sensor_type: 4,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        let tracker = tracker_at(&registry, 1).await;
        assert_eq!(tracker.capabilities.imu_type, 4);
        assert_eq!(tracker.name, "udp://01:01:01:01:01:01/1");
        assert_eq!(host.added_trackers().len(), 1);

        let sent = sender.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, test_addr(1));
        assert_eq!(sent[0].1, [0, 0, 0, 15, 1, 1]);
    }

    #[tokio::test]
    async fn test_signal_strength_applies_to_all_trackers() {
        let (registry, host) = registry_with_sensors(2).await;
        let sender = TrackingSender::new();

        let packet = Packet::SignalStrength {
            sensor_id: 0,
            signal_strength: -48,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        for sensor_id in [0, 1] {
            let state = tracker_at(&registry, sensor_id).await.snapshot();
            assert_eq!(state.signal_strength, -48);
        }
    }

    #[tokio::test]
    async fn test_temperature_applies_to_the_addressed_tracker() {
        let (registry, host) = registry_with_sensors(2).await;
        let sender = TrackingSender::new();

        let packet = Packet::Temperature {
            sensor_id: 1,
            temperature: 36.5,
        };
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        assert_eq!(tracker_at(&registry, 0).await.snapshot().temperature, 0.0);
        assert_eq!(tracker_at(&registry, 1).await.snapshot().temperature, 36.5);
    }

    #[rstest]
    #[case::full(2, vec![
        ResetEvent::Started(ResetKind::Full),
        ResetEvent::Full("TrackerServer".to_string()),
    ])]
    #[case::yaw(3, vec![
        ResetEvent::Started(ResetKind::Yaw),
        ResetEvent::Yaw("TrackerServer".to_string()),
    ])]
    #[case::mounting(4, vec![
        ResetEvent::Started(ResetKind::Mounting),
        ResetEvent::Mounting("TrackerServer".to_string()),
    ])]
    #[case::unknown(9, vec![])]
    #[tokio::test]
    async fn test_user_action_reset_dispatch(
        #[case] action: u8,
        #[case] expected: Vec<ResetEvent>,
    ) {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();

        deliver(&registry, &host, &sender, &Packet::UserAction { action }, 1, test_addr(1))
            .await;

        assert_eq!(host.reset_events(), expected);
    }

    #[tokio::test]
    async fn test_feature_flags_reply_then_store() {
        let (registry, host) = registry_with_sensors(0).await;
        let sender = TrackingSender::new();

        let packet = Packet::FeatureFlags(FirmwareFeatures::from_packed(&[0x05]));
        deliver(&registry, &host, &sender, &packet, 1, test_addr(1)).await;

        let sent = sender.take_sent().await;
        assert_eq!(sent.len(), 1);
        let mut reply: &[u8] = &sent[0].1;
        assert_eq!(reply.try_get_u32().unwrap(), KIND_FEATURE_FLAGS);

        let reg = registry.read().await;
        let features = &reg.device(0).unwrap().firmware_features;
        assert!(features.has(0));
        assert!(features.has(2));
        assert!(!features.has(1));
    }

    #[tokio::test]
    async fn test_non_handshake_from_unknown_sender_is_dropped() {
        let registry = RwLock::new(ConnectionRegistry::new());
        let host = RecordingHost::new();
        let sender = TrackingSender::new();

        deliver(&registry, &host, &sender, &Packet::PingPong { ping_id: 1 }, 1, test_addr(9))
            .await;
        deliver(
            &registry,
            &host,
            &sender,
            &Packet::UserAction { action: 2 },
            1,
            test_addr(9),
        )
        .await;

        assert!(registry.read().await.is_empty());
        sender.assert_nothing_sent().await;
        assert!(host.reset_events().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let (registry, host) = registry_with_sensors(1).await;
        let sender = TrackingSender::new();

        on_datagram(&registry, &host, &sender, &mut BytesMut::new(), &[1, 2], test_addr(1)).await;
        on_datagram(
            &registry,
            &host,
            &sender,
            &mut BytesMut::new(),
            &[0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 0],
            test_addr(1),
        )
        .await;

        sender.assert_nothing_sent().await;
    }
}
