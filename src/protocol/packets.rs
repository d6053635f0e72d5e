use bytes::{Buf, BufMut, BytesMut};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::protocol::*;

/// Everything a device announces in its first packet. Fields beyond the kind
///  are optional on the wire: the oldest firmware stops after the packet
///  number, and absent values fall back to zero / empty, which is also what
///  routes such devices onto the legacy dialect.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct HandshakeData {
    pub board_type: u32,
    pub imu_type: u32,
    pub mcu_type: u32,
    pub firmware_build: u32,
    pub firmware: String,
    pub mac: Option<MacAddress>,
}

/// One logical packet as it arrives from a device, after framing and
///  duplicate suppression. Dispatch is an exhaustive match on this.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Heartbeat,
    Rotation {
        rotation: UnitQuaternion<f32>,
    },
    Handshake(HandshakeData),
    Acceleration {
        vector: Vector3<f32>,
        sensor_id: u8,
    },
    PingPong {
        ping_id: u32,
    },
    Serial {
        line: String,
    },
    Battery {
        voltage: f32,
        level: f32,
    },
    Tap {
        sensor_id: u8,
        tap: u8,
    },
    Error {
        sensor_id: u8,
        error_code: u8,
    },
    SensorInfo {
        sensor_id: u8,
        sensor_status: u8,
        sensor_type: u8,
    },
    RotationData {
        sensor_id: u8,
        data_type: u8,
        rotation: UnitQuaternion<f32>,
        accuracy_info: u8,
    },
    MagnetometerAccuracy {
        sensor_id: u8,
        accuracy: f32,
    },
    SignalStrength {
        sensor_id: u8,
        signal_strength: i8,
    },
    Temperature {
        sensor_id: u8,
        temperature: f32,
    },
    UserAction {
        action: u8,
    },
    FeatureFlags(FirmwareFeatures),
}

impl Packet {
    pub fn kind(&self) -> u32 {
        match self {
            Packet::Heartbeat => KIND_HEARTBEAT,
            Packet::Rotation { .. } => KIND_ROTATION,
            Packet::Handshake(_) => KIND_HANDSHAKE,
            Packet::Acceleration { .. } => KIND_ACCELERATION,
            Packet::PingPong { .. } => KIND_PING_PONG,
            Packet::Serial { .. } => KIND_SERIAL,
            Packet::Battery { .. } => KIND_BATTERY_LEVEL,
            Packet::Tap { .. } => KIND_TAP,
            Packet::Error { .. } => KIND_ERROR,
            Packet::SensorInfo { .. } => KIND_SENSOR_INFO,
            Packet::RotationData { .. } => KIND_ROTATION_DATA,
            Packet::MagnetometerAccuracy { .. } => KIND_MAGNETOMETER_ACCURACY,
            Packet::SignalStrength { .. } => KIND_SIGNAL_STRENGTH,
            Packet::Temperature { .. } => KIND_TEMPERATURE,
            Packet::UserAction { .. } => KIND_USER_ACTION,
            Packet::FeatureFlags(_) => KIND_FEATURE_FLAGS,
        }
    }

    /// Serializes the device-side encoding of this packet. The server itself
    ///  only ever sends the handful of responses in [crate::protocol::codec];
    ///  this exists for device emulation and for the round-trip tests that
    ///  pin the wire format.
    pub fn ser(&self, buf: &mut BytesMut, packet_number: u64) {
        buf.put_u32(self.kind());
        buf.put_u64(packet_number);
        match self {
            Packet::Heartbeat => {}
            Packet::Rotation { rotation } => ser_quaternion(rotation, buf),
            Packet::Handshake(data) => Self::ser_handshake(data, buf),
            Packet::Acceleration { vector, sensor_id } => {
                buf.put_f32(vector.x);
                buf.put_f32(vector.y);
                buf.put_f32(vector.z);
                buf.put_u8(*sensor_id);
            }
            Packet::PingPong { ping_id } => buf.put_u32(*ping_id),
            Packet::Serial { line } => {
                buf.put_u32(line.len() as u32);
                buf.put_slice(line.as_bytes());
            }
            Packet::Battery { voltage, level } => {
                buf.put_f32(*voltage);
                buf.put_f32(*level);
            }
            Packet::Tap { sensor_id, tap } => {
                buf.put_u8(*sensor_id);
                buf.put_u8(*tap);
            }
            Packet::Error { sensor_id, error_code } => {
                buf.put_u8(*sensor_id);
                buf.put_u8(*error_code);
            }
            Packet::SensorInfo {
                sensor_id,
                sensor_status,
                sensor_type,
            } => {
                buf.put_u8(*sensor_id);
                buf.put_u8(*sensor_status);
                buf.put_u8(*sensor_type);
            }
            Packet::RotationData {
                sensor_id,
                data_type,
                rotation,
                accuracy_info,
            } => {
                buf.put_u8(*sensor_id);
                buf.put_u8(*data_type);
                ser_quaternion(rotation, buf);
                buf.put_u8(*accuracy_info);
            }
            Packet::MagnetometerAccuracy { sensor_id, accuracy } => {
                buf.put_u8(*sensor_id);
                buf.put_f32(*accuracy);
            }
            Packet::SignalStrength {
                sensor_id,
                signal_strength,
            } => {
                buf.put_u8(*sensor_id);
                buf.put_i8(*signal_strength);
            }
            Packet::Temperature {
                sensor_id,
                temperature,
            } => {
                buf.put_u8(*sensor_id);
                buf.put_f32(*temperature);
            }
            Packet::UserAction { action } => buf.put_u8(*action),
            Packet::FeatureFlags(flags) => buf.put_slice(flags.packed()),
        }
    }

    fn ser_handshake(data: &HandshakeData, buf: &mut BytesMut) {
        buf.put_u32(data.board_type);
        buf.put_u32(data.imu_type);
        buf.put_u32(data.mcu_type);
        for _ in 0..3 {
            buf.put_u32(0);
        }
        buf.put_u32(data.firmware_build);
        buf.put_u8(data.firmware.len() as u8);
        buf.put_slice(data.firmware.as_bytes());
        buf.put_slice(&data.mac.map(|m| m.0).unwrap_or([0; 6]));
    }

    /// Parses the payload of a packet whose kind and packet number have
    ///  already been consumed. `Ok(None)` means the kind is unknown or
    ///  reserved and the datagram should be ignored, which is distinct from
    ///  a malformed payload.
    pub(crate) fn deser_payload(kind: u32, buf: &mut impl Buf) -> anyhow::Result<Option<Packet>> {
        let packet = match kind {
            KIND_HEARTBEAT => Packet::Heartbeat,
            KIND_ROTATION => Packet::Rotation {
                rotation: deser_quaternion(buf)?,
            },
            KIND_HANDSHAKE => Packet::Handshake(Self::deser_handshake(buf)),
            KIND_ACCELERATION => {
                let x = buf.try_get_f32()?;
                let y = buf.try_get_f32()?;
                let z = buf.try_get_f32()?;
                // old firmware has a single sensor and sends no id
                let sensor_id = buf.try_get_u8().unwrap_or(0);
                Packet::Acceleration {
                    vector: Vector3::new(x, y, z),
                    sensor_id,
                }
            }
            KIND_PING_PONG => Packet::PingPong {
                ping_id: buf.try_get_u32()?,
            },
            KIND_SERIAL => {
                let len = buf.try_get_u32()? as usize;
                if buf.remaining() < len {
                    anyhow::bail!("serial payload truncated: {} of {} bytes", buf.remaining(), len);
                }
                let bytes = buf.copy_to_bytes(len);
                Packet::Serial {
                    line: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
            KIND_BATTERY_LEVEL => Packet::Battery {
                voltage: buf.try_get_f32()?,
                level: buf.try_get_f32()?,
            },
            KIND_TAP => Packet::Tap {
                sensor_id: buf.try_get_u8()?,
                tap: buf.try_get_u8()?,
            },
            KIND_ERROR => Packet::Error {
                sensor_id: buf.try_get_u8()?,
                error_code: buf.try_get_u8()?,
            },
            KIND_SENSOR_INFO => Packet::SensorInfo {
                sensor_id: buf.try_get_u8()?,
                sensor_status: buf.try_get_u8()?,
                // added in later firmware
                sensor_type: buf.try_get_u8().unwrap_or(0),
            },
            KIND_ROTATION_DATA => Packet::RotationData {
                sensor_id: buf.try_get_u8()?,
                data_type: buf.try_get_u8()?,
                rotation: deser_quaternion(buf)?,
                accuracy_info: buf.try_get_u8().unwrap_or(0),
            },
            KIND_MAGNETOMETER_ACCURACY => Packet::MagnetometerAccuracy {
                sensor_id: buf.try_get_u8()?,
                accuracy: buf.try_get_f32()?,
            },
            KIND_SIGNAL_STRENGTH => Packet::SignalStrength {
                sensor_id: buf.try_get_u8()?,
                signal_strength: buf.try_get_i8()?,
            },
            KIND_TEMPERATURE => Packet::Temperature {
                sensor_id: buf.try_get_u8()?,
                temperature: buf.try_get_f32()?,
            },
            KIND_USER_ACTION => Packet::UserAction {
                action: buf.try_get_u8()?,
            },
            KIND_FEATURE_FLAGS => {
                let bytes = buf.copy_to_bytes(buf.remaining());
                Packet::FeatureFlags(FirmwareFeatures::from_packed(&bytes))
            }
            KIND_PROTOCOL_CHANGE => return Ok(None), // reserved
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }

    fn deser_handshake(buf: &mut impl Buf) -> HandshakeData {
        let board_type = buf.try_get_u32().unwrap_or(0);
        let imu_type = buf.try_get_u32().unwrap_or(0);
        let mcu_type = buf.try_get_u32().unwrap_or(0);
        for _ in 0..3 {
            let _ = buf.try_get_u32();
        }
        let firmware_build = buf.try_get_u32().unwrap_or(0);

        let firmware = match buf.try_get_u8() {
            Ok(len) => {
                let len = (len as usize).min(buf.remaining());
                let bytes = buf.copy_to_bytes(len);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(_) => String::new(),
        };

        let mac = if buf.remaining() >= 6 {
            let mut bytes = [0u8; 6];
            buf.copy_to_slice(&mut bytes);
            MacAddress::from_bytes(bytes)
        } else {
            None
        };

        HandshakeData {
            board_type,
            imu_type,
            mcu_type,
            firmware_build,
            firmware,
            mac,
        }
    }
}

fn ser_quaternion(q: &UnitQuaternion<f32>, buf: &mut BytesMut) {
    buf.put_f32(q.i);
    buf.put_f32(q.j);
    buf.put_f32(q.k);
    buf.put_f32(q.w);
}

fn deser_quaternion(buf: &mut impl Buf) -> anyhow::Result<UnitQuaternion<f32>> {
    let x = buf.try_get_f32()?;
    let y = buf.try_get_f32()?;
    let z = buf.try_get_f32()?;
    let w = buf.try_get_f32()?;
    Ok(UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)))
}
