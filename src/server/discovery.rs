use std::net::{IpAddr, SocketAddr};

use tracing::{debug, error};

/// Collects the IPv4 broadcast address of every usable interface, paired
///  with the tracker port. Called once at startup: interfaces coming up
///  later are not picked up until a restart.
///
/// Loopback is skipped, and point-to-point or virtual interfaces exclude
///  themselves by not carrying a broadcast address. If enumeration fails
///  outright the set is empty and discovery stays disabled.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            error!("enumerating network interfaces failed, discovery is disabled: {}", e);
            return Vec::new();
        }
    };

    let mut targets = Vec::new();
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = interface.addr {
            if let Some(broadcast) = v4.broadcast {
                let target = SocketAddr::from((IpAddr::V4(broadcast), port));
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }
    debug!(?targets, "discovery broadcast targets");
    targets
}
