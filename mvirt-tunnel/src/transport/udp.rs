//! UDP transport: one datagram per payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use tracing::info;

use super::{Connection, DatagramListen, Dial, PacketSocket, Transport, TransportKind};
use crate::error::{Result, TunnelError};

pub struct UdpTransport {
    addr: SocketAddr,
}

impl UdpTransport {
    /// `addr` is the server address to dial, or the address to listen on.
    pub fn new(addr: SocketAddr) -> Self {
        UdpTransport { addr }
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn endpoint_ip(&self) -> Option<IpAddr> {
        Some(self.addr.ip())
    }
}

/// Connected UDP socket talking to a single server.
pub struct UdpConnection {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl Connection for UdpConnection {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket
            .recv(buf)
            .map_err(|e| TunnelError::io("udp recv", e))
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        self.socket
            .send(buf)
            .map_err(|e| TunnelError::io("udp send", e))
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl Dial for UdpTransport {
    type Conn = UdpConnection;

    fn dial(&self) -> Result<UdpConnection> {
        let local = match self.addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).map_err(|e| TunnelError::io("udp bind", e))?;
        socket
            .connect(self.addr)
            .map_err(|e| TunnelError::io("udp connect", e))?;
        info!(peer = %self.addr, "UDP transport dialed");
        Ok(UdpConnection {
            socket,
            peer: self.addr,
        })
    }
}

impl PacketSocket for UdpSocket {
    type Addr = SocketAddr;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).map_err(|e| TunnelError::io("udp recv_from", e))
    }

    fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        UdpSocket::send_to(self, buf, addr).map_err(|e| TunnelError::io("udp send_to", e))
    }
}

impl DatagramListen for UdpTransport {
    type Socket = UdpSocket;

    fn listen(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(self.addr).map_err(|e| TunnelError::io("udp bind", e))?;
        info!(addr = %self.addr, "Listening on UDP");
        Ok(socket)
    }
}
