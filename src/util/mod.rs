use std::net::IpAddr;

use systemstat::{Platform, System};
use tracing::{debug, info};

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. Falls back to the address of
/// the default route as reported by `local-ip-address`.
///
/// ## Returns
///
/// * `Some(IpAddr)`: The first routable network interface.
/// * `None`: The host exposes no usable IPv4 address.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    match system.networks() {
        Ok(networks) => {
            for net in networks.values() {
                for n in &net.addrs {
                    if let systemstat::IpAddr::V4(v) = n.addr {
                        if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                            info!("iface: {} / {:?}", net.name, v);
                            return Some(IpAddr::V4(v));
                        }
                    }
                }
            }
        }
        Err(e) => debug!("Listing interfaces failed: {}", e),
    }

    local_ip_address::local_ip().ok()
}
