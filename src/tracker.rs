use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, MutexGuard};

use nalgebra::{UnitQuaternion, Vector3};
use num_enum::TryFromPrimitive;

/// Where a sensor currently stands from the application's point of view.
/// The numeric values are the raw status codes devices report in sensor-info
///  packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum TrackerStatus {
    Disconnected = 0,
    Ok = 1,
    Error = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TrackerCapabilities {
    pub rotation: bool,
    pub acceleration: bool,
    pub filtering: bool,
    pub needs_reset: bool,
    pub needs_mounting: bool,
    pub user_editable: bool,
    pub imu_type: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerState {
    pub rotation: UnitQuaternion<f32>,
    pub acceleration: Vector3<f32>,
    pub battery_voltage: f32,
    pub battery_level: f32,
    pub signal_strength: i8,
    pub temperature: f32,
    pub ping_ms: u32,
    pub status: TrackerStatus,
    pub data_ticks: u64,
}

/// One logical sensor, as handed to the enclosing application. The server
///  writes telemetry into it from the event loop; the application reads
///  concurrently through [Tracker::snapshot] or the individual getters, so
///  the mutable part lives behind a lock.
pub struct Tracker {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub capabilities: TrackerCapabilities,
    state: Mutex<TrackerState>,
}

impl Debug for Tracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tracker{{#{} {:?}}}", self.id, self.name)
    }
}

impl Tracker {
    pub fn new(
        id: u32,
        name: String,
        description: String,
        capabilities: TrackerCapabilities,
        status: TrackerStatus,
    ) -> Tracker {
        Tracker {
            id,
            name,
            description,
            capabilities,
            state: Mutex::new(TrackerState {
                rotation: UnitQuaternion::identity(),
                acceleration: Vector3::zeros(),
                battery_voltage: 0.0,
                battery_level: 0.0,
                signal_strength: 0,
                temperature: 0.0,
                ping_ms: 0,
                status,
                data_ticks: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("tracker state lock poisoned")
    }

    pub fn snapshot(&self) -> TrackerState {
        self.state().clone()
    }

    pub fn set_rotation(&self, rotation: UnitQuaternion<f32>) {
        self.state().rotation = rotation;
    }

    pub fn rotation(&self) -> UnitQuaternion<f32> {
        self.state().rotation
    }

    pub fn set_acceleration(&self, acceleration: Vector3<f32>) {
        self.state().acceleration = acceleration;
    }

    pub fn acceleration(&self) -> Vector3<f32> {
        self.state().acceleration
    }

    pub fn set_battery(&self, voltage: f32, level: f32) {
        let mut state = self.state();
        state.battery_voltage = voltage;
        state.battery_level = level;
    }

    pub fn set_signal_strength(&self, signal_strength: i8) {
        self.state().signal_strength = signal_strength;
    }

    pub fn set_temperature(&self, temperature: f32) {
        self.state().temperature = temperature;
    }

    pub fn set_ping(&self, ping_ms: u32) {
        self.state().ping_ms = ping_ms;
    }

    pub fn ping_ms(&self) -> u32 {
        self.state().ping_ms
    }

    pub fn set_status(&self, status: TrackerStatus) {
        self.state().status = status;
    }

    pub fn status(&self) -> TrackerStatus {
        self.state().status
    }

    /// One beat of the orientation clock; battery and the other slow channels
    ///  do not tick it.
    pub fn data_tick(&self) {
        self.state().data_ticks += 1;
    }

    pub fn data_ticks(&self) -> u64 {
        self.state().data_ticks
    }
}
