//! Multiaddress classification helpers used by the dial ranker.

use multiaddr::{Multiaddr, Protocol};

/// True if the address reaches the peer through a relay circuit.
pub fn is_relay(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// True if the address carries an IPv4 or IPv6 component.
pub fn is_ip(addr: &Multiaddr) -> bool {
    addr.iter()
        .any(|p| matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_)))
}

/// True if the address carries an IPv4 component.
pub fn is_ip4(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Ip4(_)))
}

/// True if the address carries an IPv6 component.
pub fn is_ip6(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Ip6(_)))
}

/// True for localhost and local-network (RFC 1918 / ULA / link-local)
/// addresses.
pub fn is_private(addr: &Multiaddr) -> bool {
    for p in addr.iter() {
        match p {
            Protocol::Ip4(ip) => {
                return ip.is_private() || ip.is_loopback() || ip.is_link_local();
            }
            Protocol::Ip6(ip) => {
                let seg = ip.segments();
                let unique_local = (seg[0] & 0xfe00) == 0xfc00;
                let link_local = (seg[0] & 0xffc0) == 0xfe80;
                return ip.is_loopback() || unique_local || link_local;
            }
            _ => {}
        }
    }
    false
}

/// True for QUIC-class addresses (QUIC, QUIC v1, and WebTransport, which
/// nests a QUIC component).
pub fn is_quic(addr: &Multiaddr) -> bool {
    addr.iter()
        .any(|p| matches!(p, Protocol::Quic | Protocol::QuicV1))
}

/// True for TCP-class addresses.
pub fn is_tcp(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Tcp(_)))
}

/// The transport port of the address, if any.
pub fn port(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(port) | Protocol::Udp(port) => Some(port),
        _ => None,
    })
}

/// Score an address for dial ordering. Lower is better.
///
/// The low 16 bits are the port: low ports rank first because they are more
/// likely to be stable listen ports rather than ephemeral ones. Above that,
/// transport class: QUIC v1 before draft-29 QUIC before WebTransport before
/// TCP before everything else, and IPv6 before IPv4 within a class.
pub(crate) fn dial_score(addr: &Multiaddr) -> u64 {
    let ip4_weight: u64 = if is_ip4(addr) { 1 << 18 } else { 0 };
    let port = port(addr).unwrap_or(0) as u64;

    if addr.iter().any(|p| matches!(p, Protocol::WebTransport)) {
        return ip4_weight + (1 << 19) + port;
    }
    if addr.iter().any(|p| matches!(p, Protocol::Quic)) {
        return ip4_weight + (1 << 17) + port;
    }
    if addr.iter().any(|p| matches!(p, Protocol::QuicV1)) {
        return ip4_weight + port;
    }
    if addr.iter().any(|p| matches!(p, Protocol::Tcp(_))) {
        return ip4_weight + (1 << 20) + port;
    }
    1 << 30
}
