use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// The (IPv4 address, port) pair identifying a remote peer. Endpoints are
/// small copyable values; equality and hashing cover the whole pair. The
/// receive path additionally leases endpoint *records* from a pool and
/// transfers them with the packet buffer, releasing them once the ingress
/// accumulator has copied the value out.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Endpoint {
    address: Ipv4Addr,
    port: u16,
}

impl Default for Endpoint {
    #[inline]
    fn default() -> Endpoint {
        Endpoint {
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }
}

impl Endpoint {
    #[inline]
    pub fn new(address: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { address, port }
    }

    /// Extracts an endpoint from a socket address. Non-IPv4 sources are
    /// rejected; the core binds IPv4 only.
    #[inline]
    pub fn from_addr(addr: SocketAddr) -> Option<Endpoint> {
        match addr {
            SocketAddr::V4(v4) => Some(Endpoint::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        }
    }

    #[inline]
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Overwrite this record in place with another endpoint's value.
    #[inline]
    pub fn set(&mut self, other: Endpoint) {
        *self = other;
    }

    #[inline]
    pub fn to_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
