//! Host address detection.

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use log::warn;

/// Public address used only to pick an outbound route; no packet is sent.
const ROUTE_PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Detect the address this host uses for outbound traffic.
///
/// "Connecting" a UDP socket only selects a route, so this works offline as
/// long as a default route exists.
pub fn detect_host_address() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_PROBE_TARGET)?;
    Ok(socket.local_addr()?.ip())
}

/// [`detect_host_address`], falling back to loopback with a warning.
pub fn host_address_or_loopback() -> IpAddr {
    match detect_host_address() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("could not detect host address ({e}); falling back to 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_address_is_never_unspecified() {
        // Hosts without a default route legitimately fail here.
        if let Ok(addr) = detect_host_address() {
            assert!(!addr.is_unspecified());
        }
    }
}
