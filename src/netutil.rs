//! Advertised-address discovery and socket comparison.
//!
//! Peers identify each other by `(host, port)`.  Two sockets are the same
//! peer when the ports match and the hosts are either textually equal or
//! both loopback — a fleet under test runs several processes on one
//! machine, and `127.0.0.1`, `127.0.0.2` and `::1` all mean "here".

use std::net::{IpAddr, UdpSocket};

use crate::errors::NodeError;

/// Discover the address this process should advertise to peers.
///
/// Opens an unbound UDP socket toward a public address (no packet is
/// sent) and reads back the source address the routing table picked.
/// Fails with [`NodeError::NetworkUnavailable`] when the chosen address
/// is loopback or unspecified.
pub fn external_ip() -> Result<IpAddr, NodeError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| NodeError::NetworkUnavailable)?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|_| NodeError::NetworkUnavailable)?;
    let ip = socket
        .local_addr()
        .map_err(|_| NodeError::NetworkUnavailable)?
        .ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(NodeError::NetworkUnavailable);
    }
    Ok(ip)
}

/// Resolve the host to advertise in the node record.
///
/// With `localhost` set, a missing non-loopback interface degrades to
/// `127.0.0.1`; otherwise it is an error.
pub fn advertised_host(localhost: bool) -> Result<String, NodeError> {
    match external_ip() {
        Ok(ip) => Ok(ip.to_string()),
        Err(NodeError::NetworkUnavailable) if localhost => Ok("127.0.0.1".to_string()),
        Err(e) => Err(e),
    }
}

/// Whether a host string denotes a loopback address.
pub fn is_loopback_host(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}

/// Socket equality with loopback equivalence.
pub fn sockets_equal(host_a: &str, port_a: u16, host_b: &str, port_b: u16) -> bool {
    if port_a != port_b {
        return false;
    }
    host_a == host_b || (is_loopback_host(host_a) && is_loopback_host(host_b))
}

/// Format a `(host, port)` pair as a socket string, bracketing IPv6 hosts.
pub fn format_socket(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
