//! TCP port probing and hostname resolution.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;

/// Probe timeout for plain occupancy checks.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Check whether a local TCP port is occupied.
///
/// A successful connect means something is listening; connect errors mean
/// free. Resolution problems are logged and treated as free.
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => true,
        Err(e) => {
            debug!("Port {port} probe: {e}");
            false
        }
    }
}

/// Check that a SOCKS5 endpoint accepts TCP connections.
pub fn socks5_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    info!("Testing SOCKS5 connectivity to {host}:{port}");

    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Cannot resolve SOCKS5 endpoint {host}:{port}: {e}");
            return false;
        }
    };

    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            info!("SOCKS5 proxy at {host}:{port} is accessible");
            return true;
        }
    }
    warn!("Cannot connect to SOCKS5 proxy at {host}:{port}");
    false
}

/// Resolve a hostname to its first IP address.
pub fn resolve_hostname(hostname: &str) -> Result<IpAddr, Error> {
    let mut addrs = (hostname, 0u16)
        .to_socket_addrs()
        .map_err(|e| Error::Connectivity(format!("failed to resolve hostname {hostname}: {e}")))?;

    match addrs.next() {
        Some(addr) => {
            info!("Resolved {hostname} to {}", addr.ip());
            Ok(addr.ip())
        }
        None => Err(Error::Connectivity(format!(
            "no addresses returned for hostname {hostname}"
        ))),
    }
}

/// First free port in `range`, if any.
pub fn find_available_port(range: std::ops::RangeInclusive<u16>) -> Option<u16> {
    range.into_iter().find(|&port| !port_in_use(port))
}
