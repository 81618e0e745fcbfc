//! 6-byte wire peer address: 4-byte IPv4 big-endian + 2-byte port big-endian.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const PEER_ADDR_LEN: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr([u8; PEER_ADDR_LEN]);

impl PeerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        let mut bytes = [0u8; PEER_ADDR_LEN];
        bytes[..4].copy_from_slice(&ip.octets());
        bytes[4..].copy_from_slice(&port.to_be_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PEER_ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; PEER_ADDR_LEN] {
        self.0
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    pub fn port(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port()))
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for PeerAddr {
    type Error = NotIpv4;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(_) => Err(NotIpv4),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer address must be IPv4")]
pub struct NotIpv4;

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let a = PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 40001);
        let bytes = a.to_bytes();
        let b = PeerAddr::from_bytes(bytes);
        assert_eq!(a, b);
        assert_eq!(b.port(), 40001);
        assert_eq!(b.ip(), Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn byte_equality() {
        let a = PeerAddr::new(Ipv4Addr::new(10, 0, 0, 1), 1);
        let b = PeerAddr::new(Ipv4Addr::new(10, 0, 0, 1), 1);
        let c = PeerAddr::new(Ipv4Addr::new(10, 0, 0, 1), 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
