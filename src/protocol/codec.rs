use bytes::{Buf, BufMut, BytesMut};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::packets::Packet;
use crate::protocol::*;
use crate::server::device::UdpDevice;

/// Parses one datagram into the packets it carries.
///
/// `device` is the record already associated with the sender's address, if
///  any; it is needed for duplicate suppression and for the serial
///  accumulator, and its liveness stamp is refreshed by any datagram that
///  validates. Handshakes arrive before a device exists and are exempt from
///  suppression (a rebooted device restarts its packet numbering, and the
///  handshake update resets the counter to match).
pub fn parse(data: &[u8], mut device: Option<&mut UdpDevice>) -> anyhow::Result<Vec<Packet>> {
    let mut buf = data;
    let kind = buf.try_get_u32()?;

    // bare legacy heartbeats carry no packet number
    let packet_number = if kind == KIND_HEARTBEAT && buf.remaining() < 8 {
        0
    } else {
        buf.try_get_u64()?
    };

    if kind != KIND_HANDSHAKE {
        if let Some(d) = device.as_deref_mut() {
            if packet_number != 0 && packet_number <= d.last_packet_number {
                debug!(
                    kind,
                    packet_number, d.last_packet_number, "dropping out-of-order or duplicate packet"
                );
                return Ok(Vec::new());
            }
            if packet_number > d.last_packet_number {
                d.last_packet_number = packet_number;
            }
        }
    }

    let packets = match Packet::deser_payload(kind, &mut buf)? {
        Some(Packet::Serial { line }) => match device.as_deref_mut() {
            Some(d) => accumulate_serial(d, &line),
            // no session to buffer into; discarded like any other
            //  packet from an unknown sender
            None => Vec::new(),
        },
        Some(packet) => vec![packet],
        None => {
            debug!(kind, "ignoring packet of unknown kind");
            Vec::new()
        }
    };

    if let Some(d) = device.as_deref_mut() {
        d.last_packet_time = Instant::now();
    }
    Ok(packets)
}

/// Appends console text to the device's serial buffer and splits off every
///  completed line for immediate forwarding. The unfinished tail stays
///  buffered until the keepalive sweep's idle flush.
fn accumulate_serial(device: &mut UdpDevice, text: &str) -> Vec<Packet> {
    device.serial_buffer.push_str(text);
    device.last_serial_update = Instant::now();

    let mut lines = Vec::new();
    while let Some(pos) = device.serial_buffer.find('\n') {
        let mut line: String = device.serial_buffer.drain(..=pos).collect();
        line.truncate(line.trim_end_matches(['\n', '\r']).len());
        lines.push(Packet::Serial { line });
    }
    lines
}

pub fn write_discovery(buf: &mut BytesMut) {
    buf.clear();
    buf.put_u32(KIND_HEARTBEAT);
    buf.put_u64(0);
}

pub fn write_keepalive(buf: &mut BytesMut) {
    buf.clear();
    buf.put_u32(KIND_KEEPALIVE);
    buf.put_u64(0);
}

pub fn write_handshake_response(buf: &mut BytesMut) {
    buf.clear();
    buf.put_u8(KIND_HANDSHAKE as u8);
    buf.put_slice(HANDSHAKE_GREETING);
}

pub fn write_sensor_info_response(buf: &mut BytesMut, sensor_id: u8, raw_status: u8) {
    buf.clear();
    buf.put_u32(KIND_SENSOR_INFO);
    buf.put_u8(sensor_id);
    buf.put_u8(raw_status);
}

pub fn write_feature_flags_response(buf: &mut BytesMut, flags: &FirmwareFeatures) {
    buf.clear();
    buf.put_u32(KIND_FEATURE_FLAGS);
    buf.put_u64(0);
    buf.put_slice(flags.packed());
}

/// Raw ping format: kind, a zero sequence, and the nonce the device must
///  echo back.
pub fn write_ping(buf: &mut BytesMut, ping_id: u32) {
    buf.clear();
    buf.put_u32(KIND_PING_PONG);
    buf.put_u64(0);
    buf.put_u32(ping_id);
}
