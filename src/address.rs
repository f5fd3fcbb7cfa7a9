//! Exporter endpoint addresses.
//!
//! A collector peers with exporters identified only by source address, so the
//! address type doubles as the peer-table key. Ordering is total and
//! deterministic (family, then address bytes, then v6 scope) so that state
//! dumps always come out in the same order.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

/// Address family tag for an [`Xaddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A single exporter endpoint address.
///
/// IPv6 link-local addresses are only meaningful together with their scope
/// id, so the scope participates in equality and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Xaddr {
    V4(Ipv4Addr),
    V6 { addr: Ipv6Addr, scope_id: u32 },
}

impl Xaddr {
    pub fn family(&self) -> AddressFamily {
        match self {
            Xaddr::V4(_) => AddressFamily::V4,
            Xaddr::V6 { .. } => AddressFamily::V6,
        }
    }

    pub fn is_v4(&self) -> bool {
        self.family() == AddressFamily::V4
    }

    pub fn is_v6(&self) -> bool {
        self.family() == AddressFamily::V6
    }

    /// The bare IP address, without the v6 scope.
    pub fn ip(&self) -> IpAddr {
        match self {
            Xaddr::V4(a) => IpAddr::V4(*a),
            Xaddr::V6 { addr, .. } => IpAddr::V6(*addr),
        }
    }

    /// Address bytes in network order, padded to 16 bytes for comparison.
    fn cmp_key(&self) -> (AddressFamily, [u8; 16], u32) {
        match self {
            Xaddr::V4(a) => {
                let mut bytes = [0u8; 16];
                bytes[..4].copy_from_slice(&a.octets());
                (AddressFamily::V4, bytes, 0)
            }
            Xaddr::V6 { addr, scope_id } => (AddressFamily::V6, addr.octets(), *scope_id),
        }
    }
}

impl Ord for Xaddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

impl PartialOrd for Xaddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<IpAddr> for Xaddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(a) => Xaddr::V4(a),
            IpAddr::V6(a) => Xaddr::V6 {
                addr: a,
                scope_id: 0,
            },
        }
    }
}

impl From<Ipv4Addr> for Xaddr {
    fn from(a: Ipv4Addr) -> Self {
        Xaddr::V4(a)
    }
}

impl From<SocketAddr> for Xaddr {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Xaddr::V4(*v4.ip()),
            SocketAddr::V6(v6) => Xaddr::V6 {
                addr: *v6.ip(),
                scope_id: v6.scope_id(),
            },
        }
    }
}

impl fmt::Display for Xaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Xaddr::V4(a) => write!(f, "{}", a),
            Xaddr::V6 { addr, scope_id: 0 } => write!(f, "{}", addr),
            Xaddr::V6 { addr, scope_id } => write!(f, "{}%{}", addr, scope_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_sorts_before_v6() {
        let a = Xaddr::V4(Ipv4Addr::new(255, 255, 255, 255));
        let b = Xaddr::V6 {
            addr: Ipv6Addr::UNSPECIFIED,
            scope_id: 0,
        };
        assert!(a < b);
    }

    #[test]
    fn v4_orders_by_bytes() {
        let a = Xaddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = Xaddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(a < b);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn scope_id_distinguishes_link_local() {
        let ll: Ipv6Addr = "fe80::1".parse().unwrap();
        let a = Xaddr::V6 {
            addr: ll,
            scope_id: 1,
        };
        let b = Xaddr::V6 {
            addr: ll,
            scope_id: 2,
        };
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(format!("{}", a), "fe80::1%1");
    }

    #[test]
    fn from_socket_addr_keeps_scope() {
        let sa: SocketAddr = "[fe80::1%3]:2055".parse().unwrap();
        match Xaddr::from(sa) {
            Xaddr::V6 { scope_id, .. } => assert_eq!(scope_id, 3),
            _ => panic!("expected v6"),
        }
    }
}
