//! A thin wrapper around [`tokio::net::UdpSocket`], adding the
//! `SO_REUSEADDR` bind and multicast-join support the mapping engines need.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

/// A UDP socket bound to a specific local address.
#[derive(Debug)]
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
}

impl UdpSocket {
    /// Binds a new UDP socket to `addr`.
    ///
    /// A port of `0` asks the OS for an ephemeral port. `SO_REUSEADDR` is
    /// set before binding, so that repeated probe/refresh attempts against
    /// the same local address don't race a not-yet-released prior socket.
    pub fn bind_full(addr: impl Into<SocketAddr>) -> io::Result<Self> {
        let addr = addr.into();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        let inner = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Self { inner })
    }

    /// Binds an ephemeral UDP socket on `local_ip`.
    pub fn bind_ephemeral(local_ip: Ipv4Addr) -> io::Result<Self> {
        Self::bind_full(SocketAddr::V4(SocketAddrV4::new(local_ip, 0)))
    }

    /// Sends `buf` to `peer`.
    pub async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, peer).await
    }

    /// Receives a datagram from any peer.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    /// Joins the given IPv4 multicast group on `interface`.
    pub fn join_multicast_v4(&self, multiaddr: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.inner.join_multicast_v4(multiaddr, interface)
    }

    /// The local address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
