use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::protocol::packets::HandshakeData;
use crate::server::device::UdpDevice;

/// Owns every device record the server has ever seen, in insertion order,
///  with lookups by current socket address and by hardware identity.
///
/// The position in the insertion-ordered list is a device's connection index;
///  it is stable for the life of the process and used only for diagnostics.
///  Records are never removed, so indices never shift.
///
/// Shared as `Arc<RwLock<ConnectionRegistry>>`: the event loop is the only
///  writer, while the application may take read snapshots at any time. Lock
///  acquisitions are per-operation and must not be held across socket sends.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    devices: Vec<UdpDevice>,
    by_address: FxHashMap<SocketAddr, usize>,
    by_hardware_id: FxHashMap<String, usize>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, index: usize) -> Option<&UdpDevice> {
        self.devices.get(index)
    }

    pub(crate) fn device_mut(&mut self, index: usize) -> Option<&mut UdpDevice> {
        self.devices.get_mut(index)
    }

    pub fn device_by_address(&self, address: SocketAddr) -> Option<&UdpDevice> {
        self.by_address.get(&address).map(|&i| &self.devices[i])
    }

    pub(crate) fn device_mut_by_address(&mut self, address: SocketAddr) -> Option<&mut UdpDevice> {
        match self.by_address.get(&address) {
            Some(&i) => self.devices.get_mut(i),
            None => None,
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &UdpDevice> {
        self.devices.iter()
    }

    pub(crate) fn devices_mut(&mut self) -> impl Iterator<Item = &mut UdpDevice> {
        self.devices.iter_mut()
    }

    /// A device's position in the insertion-ordered list. Diagnostics only.
    pub fn connection_index(&self, hardware_id: &str) -> Option<usize> {
        self.by_hardware_id.get(hardware_id).copied()
    }

    /// True once any device has a provisioned sensor; discovery broadcasts
    ///  stop at that point.
    pub fn has_any_sensors(&self) -> bool {
        self.devices.iter().any(|d| !d.trackers.is_empty())
    }

    /// Resolves a handshake to a device record, creating one for a hardware
    ///  identity seen for the first time and otherwise adopting the existing
    ///  record: the old address mapping is moved (not duplicated) to the
    ///  peer's current address, so a device roaming across addresses keeps
    ///  its record, trackers, and connection index.
    pub fn find_or_adopt(
        &mut self,
        handshake: &HandshakeData,
        peer: SocketAddr,
    ) -> (usize, bool) {
        let key = match &handshake.mac {
            Some(mac) => mac.to_string(),
            None => peer.ip().to_string(),
        };

        if let Some(&index) = self.by_hardware_id.get(&key) {
            let old_address = self.devices[index].address;
            self.by_address.remove(&old_address);
            self.devices[index].apply_handshake(handshake, peer);
            self.by_address.insert(peer, index);
            debug!(
                connection = index,
                %old_address,
                new_address = %peer,
                "moved session to new address"
            );
            return (index, true);
        }

        let index = self.devices.len();
        self.devices.push(UdpDevice::new(key.clone(), handshake, peer));
        self.by_address.insert(peer, index);
        self.by_hardware_id.insert(key, index);
        (index, false)
    }
}
