//! The datagram socket seam.
//!
//! The engine owns exactly one socket and touches it only through this
//! narrow contract, so alternative transports (test doubles, constrained
//! link-layer stacks) can be slotted in without the engine noticing.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::peer::PeerAddress;

/// Non-blocking datagram I/O plus a readiness signal for the driver.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receives one datagram; `WouldBlock` when none is pending.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddress)>;

    /// Sends one datagram to `dst` without blocking.
    fn try_send_to(&self, buf: &[u8], dst: &PeerAddress) -> io::Result<usize>;

    /// Resolves when a datagram is waiting to be received.
    async fn readable(&self) -> io::Result<()>;
}

/// Default CoAP transport: a UDP socket bound with `SO_REUSEADDR` and
/// registered with the tokio reactor.  Must be created inside a runtime.
pub struct UdpChannel {
    socket: UdpSocket,
}

impl UdpChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpChannel> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(UdpChannel { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramSocket for UdpChannel {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddress)> {
        let (len, src) = self.socket.try_recv_from(buf)?;
        Ok((len, src.into()))
    }

    fn try_send_to(&self, buf: &[u8], dst: &PeerAddress) -> io::Result<usize> {
        let addr: SocketAddr = dst.try_into()?;
        self.socket.try_send_to(buf, addr)
    }

    async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }
}
