//! Remote endpoint addresses.
//!
//! The engine runs over plain UDP sockets but keeps the address type a
//! tagged union so constrained link-layer stacks can plug in through the
//! same [`crate::udp::DatagramSocket`] seam.  Equality is per variant:
//! IPv4 compares the whole socket address, IPv6 and link-layer compare
//! (address, port) only — flow information and scope identifiers do not
//! distinguish transactions.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address of a peer on a constrained link-layer stack: an EUI-64 style
/// interface identifier plus a UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddress {
    pub addr: [u8; 8],
    pub port: u16,
}

#[derive(Debug, Clone, Copy)]
pub enum PeerAddress {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Link(LinkAddress),
}

impl PeerAddress {
    /// Feeds the transaction-id hash: IPv4 hashes the complete socket
    /// address, IPv6 and link-layer hash port then address, matching the
    /// per-variant equality above.
    pub(crate) fn hash_into(&self, key: &mut crate::hash::Key) {
        match self {
            PeerAddress::V4(sa) => {
                crate::hash::hash_bytes(&sa.port().to_be_bytes(), key);
                crate::hash::hash_bytes(&sa.ip().octets(), key);
            }
            PeerAddress::V6(sa) => {
                crate::hash::hash_bytes(&sa.port().to_be_bytes(), key);
                crate::hash::hash_bytes(&sa.ip().octets(), key);
            }
            PeerAddress::Link(la) => {
                crate::hash::hash_bytes(&la.port.to_be_bytes(), key);
                crate::hash::hash_bytes(&la.addr, key);
            }
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeerAddress::V4(a), PeerAddress::V4(b)) => a == b,
            (PeerAddress::V6(a), PeerAddress::V6(b)) => {
                a.ip() == b.ip() && a.port() == b.port()
            }
            (PeerAddress::Link(a), PeerAddress::Link(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            PeerAddress::V4(a) => {
                0u8.hash(state);
                a.hash(state);
            }
            PeerAddress::V6(a) => {
                1u8.hash(state);
                a.ip().hash(state);
                a.port().hash(state);
            }
            PeerAddress::Link(a) => {
                2u8.hash(state);
                a.hash(state);
            }
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::V4(a) => fmt::Display::fmt(a, f),
            PeerAddress::V6(a) => fmt::Display::fmt(a, f),
            PeerAddress::Link(a) => {
                for (i, b) in a.addr.iter().enumerate() {
                    if i > 0 {
                        write!(f, "-")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                write!(f, ":{}", a.port)
            }
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(sa) => PeerAddress::V4(sa),
            SocketAddr::V6(sa) => PeerAddress::V6(sa),
        }
    }
}

impl TryFrom<&PeerAddress> for SocketAddr {
    type Error = io::Error;

    fn try_from(peer: &PeerAddress) -> Result<SocketAddr, io::Error> {
        match peer {
            PeerAddress::V4(sa) => Ok(SocketAddr::V4(*sa)),
            PeerAddress::V6(sa) => Ok(SocketAddr::V6(*sa)),
            PeerAddress::Link(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "link-layer peers are not reachable over a UDP socket",
            )),
        }
    }
}
