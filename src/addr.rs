//! Address translator (C1): portable `Addr`/`IpHint` values and their
//! conversion to/from the OS `sockaddr` union, via `socket2::SockAddr` which
//! already carries the length alongside the bytes the way the spec's
//! `to_os`/`from_os` pair wants.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{ErrorKind, SocketError};

/// A portable socket address. `ip`/`port` are stored in network
/// (big-endian) byte order, matching spec.md §3's data model; use the
/// `std::net` conversions below for anything address-arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Addr {
    V4 { ip: u32, port: u16 },
    V6 { ip: [u8; 16], port: u16 },
}

impl Addr {
    pub fn port(&self) -> u16 {
        match self {
            Addr::V4 { port, .. } | Addr::V6 { port, .. } => u16::from_be(*port),
        }
    }

    /// Converts to the OS sockaddr representation, with length, via
    /// `socket2::SockAddr`.
    pub fn to_os(self) -> socket2::SockAddr {
        socket2::SockAddr::from(SocketAddr::from(self))
    }

    /// Converts from an OS sockaddr. Rejects anything that isn't
    /// AF_INET/AF_INET6, per spec.md §4.1.
    pub fn from_os(sockaddr: &socket2::SockAddr) -> Result<Addr, SocketError> {
        sockaddr
            .as_socket()
            .map(Addr::from)
            .ok_or_else(|| SocketError::new(ErrorKind::Unknown))
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Addr::V4 {
                ip: u32::from_be_bytes(v4.ip().octets()),
                port: v4.port().to_be(),
            },
            // Scope id and flowinfo are normalized to zero on send and
            // ignored on receive: no scoped-address support (spec.md §4.1).
            SocketAddr::V6(v6) => Addr::V6 {
                ip: v6.ip().octets(),
                port: v6.port().to_be(),
            },
        }
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> Self {
        match addr {
            Addr::V4 { ip, port } => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip.to_be_bytes()), u16::from_be(port)))
            }
            Addr::V6 { ip, port } => {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), u16::from_be(port), 0, 0))
            }
        }
    }
}

/// A local-IP hint used only to request or report a source/destination IP
/// without a port (the `local_ip_hint` of `send_to_from` and the `local_ip`
/// out-param of `recv_from_to`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
pub enum IpHint {
    #[default]
    None,
    V4(u32),
    V6([u8; 16]),
}

impl IpHint {
    pub fn init_none() -> Self {
        IpHint::None
    }

    pub fn init_v4(ip: Ipv4Addr) -> Self {
        IpHint::V4(u32::from_be_bytes(ip.octets()))
    }

    pub fn init_v6(ip: Ipv6Addr) -> Self {
        IpHint::V6(ip.octets())
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            IpHint::V4(ip) => Some(Ipv4Addr::from(ip.to_be_bytes())),
            _ => None,
        }
    }

    pub fn as_ipv6(&self) -> Option<Ipv6Addr> {
        match self {
            IpHint::V6(ip) => Some(Ipv6Addr::from(*ip)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let std_addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let addr = Addr::from(std_addr);
        let os = addr.to_os();
        let back = Addr::from_os(&os).unwrap();
        assert_eq!(addr, back);
        assert_eq!(SocketAddr::from(back), std_addr);
    }

    #[test]
    fn roundtrip_v6() {
        let std_addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let addr = Addr::from(std_addr);
        let os = addr.to_os();
        let back = Addr::from_os(&os).unwrap();
        assert_eq!(addr, back);
        assert_eq!(SocketAddr::from(back), std_addr);
    }

    #[test]
    fn ip_hint_v4_roundtrip() {
        let ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let hint = IpHint::init_v4(ip);
        assert_eq!(hint.as_ipv4(), Some(ip));
    }
}
