//! Broker host discovery from local network interfaces.
//!
//! The broker runs on the same LAN as the tag readers, so the relay picks the
//! machine's own LAN address when no host is configured.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, warn};

/// Lower is preferred.
fn rank(addr: Ipv4Addr) -> Option<u8> {
    if addr.is_loopback() || addr.is_unspecified() {
        return None;
    }
    let [a, b, ..] = addr.octets();
    if a == 192 && b == 168 {
        Some(0)
    } else if addr.is_private() {
        Some(1)
    } else {
        Some(2)
    }
}

/// Pick the broker host among interface addresses: `192.168.0.0/16` first,
/// then other private ranges, then any non-loopback address, else loopback.
/// Ties keep enumeration order.
pub fn select_broker_host<I>(candidates: I) -> Ipv4Addr
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut best: Option<(u8, Ipv4Addr)> = None;
    for addr in candidates {
        if let Some(r) = rank(addr) {
            if best.map_or(true, |(current, _)| r < current) {
                best = Some((r, addr));
            }
        }
    }
    best.map_or(Ipv4Addr::LOCALHOST, |(_, addr)| addr)
}

/// IPv4 addresses of all local interfaces, in enumeration order.
pub fn interface_ipv4_addrs() -> std::io::Result<Vec<(String, Ipv4Addr)>> {
    let addrs = if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) => Some((iface.name, v4)),
            IpAddr::V6(_) => None,
        })
        .collect();
    Ok(addrs)
}

/// Discover the broker host, falling back to `127.0.0.1`.
pub fn discover_broker_host() -> Ipv4Addr {
    let addrs = match interface_ipv4_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("interface enumeration failed, using loopback: {e}");
            return Ipv4Addr::LOCALHOST;
        }
    };
    for (name, addr) in &addrs {
        debug!(interface = %name, %addr, "candidate address");
    }
    let host = select_broker_host(addrs.into_iter().map(|(_, addr)| addr));
    debug!(%host, "broker host selected");
    host
}
