//! ICMP echo transport
//!
//! Payloads ride in the data section of ICMP echo messages: the client sends
//! Echo Requests and receives Echo Replies, the server does the opposite.
//! Requires CAP_NET_RAW. The server host should not answer echoes itself
//! (`net.ipv4.icmp_echo_ignore_all = 1`), otherwise clients receive their own
//! payloads back as kernel-generated replies.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, Icmpv4Repr};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use tracing::{info, trace};

use super::{Connection, DatagramListen, Dial, PacketSocket, Transport, TransportKind};
use crate::error::{Result, TunnelError};

/// Echo identifier marking tunnel traffic ("mv").
pub const ECHO_IDENT: u16 = 0x6d76;

/// Every echo carries sequence number 1.
pub const ECHO_SEQ: u16 = 1;

const RECV_BUF: usize = 65536;

pub struct IcmpTransport {
    addr: Ipv4Addr,
}

impl IcmpTransport {
    /// `addr` is the server to dial, or the local address to listen on.
    pub fn new(addr: Ipv4Addr) -> Self {
        IcmpTransport { addr }
    }
}

impl Transport for IcmpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Icmp
    }

    fn endpoint_ip(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(self.addr))
    }
}

/// Which echo direction a socket sends; it accepts the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn expected(self) -> Icmpv4Message {
        match self {
            Side::Client => Icmpv4Message::EchoReply,
            Side::Server => Icmpv4Message::EchoRequest,
        }
    }
}

/// Wrap `data` in an echo message for the given side.
pub(crate) fn encode_echo(data: &[u8], request: bool) -> Vec<u8> {
    let repr = if request {
        Icmpv4Repr::EchoRequest {
            ident: ECHO_IDENT,
            seq_no: ECHO_SEQ,
            data,
        }
    } else {
        Icmpv4Repr::EchoReply {
            ident: ECHO_IDENT,
            seq_no: ECHO_SEQ,
            data,
        }
    };
    let mut buf = vec![0u8; repr.buffer_len()];
    let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    buf
}

/// Outcome of inspecting one datagram from a raw ICMP socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Echo<'a> {
    /// Tunnel payload.
    Payload(&'a [u8]),
    /// Not ours (foreign identifier, wrong direction or too short); skip it.
    Foreign,
}

/// Unwrap a raw-socket datagram (IPv4 header included).
pub(crate) fn decode_echo(datagram: &[u8], expected: Icmpv4Message) -> Result<Echo<'_>> {
    if datagram.len() < 20 {
        return Ok(Echo::Foreign);
    }
    let ip_header_len = ((datagram[0] & 0x0f) as usize) * 4;
    let Some(icmp_data) = datagram.get(ip_header_len..) else {
        return Ok(Echo::Foreign);
    };
    let Ok(icmp) = Icmpv4Packet::new_checked(icmp_data) else {
        return Ok(Echo::Foreign);
    };

    match icmp.msg_type() {
        Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply => {
            // other pingers, and our own echoes looped back on a shared host
            if icmp.echo_ident() != ECHO_IDENT || icmp.msg_type() != expected {
                return Ok(Echo::Foreign);
            }
            Ok(Echo::Payload(icmp.data()))
        }
        other => Err(TunnelError::UnexpectedIcmp(u8::from(other))),
    }
}

/// Raw ICMP socket speaking one side of the echo exchange.
pub struct IcmpSocket {
    socket: Socket,
    side: Side,
    peer: Option<Ipv4Addr>,
}

impl IcmpSocket {
    fn open() -> Result<Socket> {
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| TunnelError::io("icmp socket", e))
    }

    fn receive(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr)> {
        let mut recv_buf = vec![MaybeUninit::<u8>::uninit(); RECV_BUF];
        loop {
            let (n, from) = self
                .socket
                .recv_from(&mut recv_buf)
                .map_err(|e| TunnelError::io("icmp recv", e))?;

            let datagram: &[u8] =
                unsafe { std::slice::from_raw_parts(recv_buf.as_ptr() as *const u8, n) };

            match decode_echo(datagram, self.side.expected())? {
                Echo::Payload(data) => {
                    let from = from
                        .as_socket_ipv4()
                        .map(|addr| *addr.ip())
                        .unwrap_or(Ipv4Addr::UNSPECIFIED);
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok((len, from));
                }
                Echo::Foreign => {
                    trace!(bytes = n, "Skipping foreign ICMP message");
                }
            }
        }
    }

    fn transmit(&self, buf: &[u8], to: Ipv4Addr) -> Result<usize> {
        let echo = encode_echo(buf, self.side == Side::Client);
        let addr = SockAddr::from(SocketAddrV4::new(to, 0));
        self.socket
            .send_to(&echo, &addr)
            .map_err(|e| TunnelError::io("icmp send", e))?;
        Ok(buf.len())
    }
}

impl Connection for IcmpSocket {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.receive(buf).map(|(n, _)| n)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        let peer = self.peer.ok_or(TunnelError::Closed("icmp socket has no peer"))?;
        self.transmit(buf, peer)
    }

    fn peer(&self) -> String {
        self.peer.map_or_else(|| "*".to_string(), |ip| ip.to_string())
    }
}

impl PacketSocket for IcmpSocket {
    type Addr = Ipv4Addr;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr)> {
        self.receive(buf)
    }

    fn send_to(&self, buf: &[u8], addr: &Ipv4Addr) -> Result<usize> {
        self.transmit(buf, *addr)
    }
}

impl Dial for IcmpTransport {
    type Conn = IcmpSocket;

    fn dial(&self) -> Result<IcmpSocket> {
        let socket = IcmpSocket::open()?;
        socket
            .connect(&SockAddr::from(SocketAddrV4::new(self.addr, 0)))
            .map_err(|e| TunnelError::io("icmp connect", e))?;
        info!(peer = %self.addr, "ICMP transport dialed");
        Ok(IcmpSocket {
            socket,
            side: Side::Client,
            peer: Some(self.addr),
        })
    }
}

impl DatagramListen for IcmpTransport {
    type Socket = IcmpSocket;

    fn listen(&self) -> Result<IcmpSocket> {
        let socket = IcmpSocket::open()?;
        if !self.addr.is_unspecified() {
            socket
                .bind(&SockAddr::from(SocketAddrV4::new(self.addr, 0)))
                .map_err(|e| TunnelError::io("icmp bind", e))?;
        }
        info!(addr = %self.addr, "Listening for ICMP echoes");
        Ok(IcmpSocket {
            socket,
            side: Side::Server,
            peer: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::packets::ipv4_packet;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    fn raw(icmp: &[u8]) -> Vec<u8> {
        ipv4_packet(SERVER, CLIENT, 1, icmp)
    }

    #[test]
    fn test_echo_framing() {
        let request = encode_echo(b"payload", true);
        let packet = Icmpv4Packet::new_checked(&request[..]).unwrap();
        assert_eq!(packet.msg_type(), Icmpv4Message::EchoRequest);
        assert_eq!(packet.echo_ident(), ECHO_IDENT);
        assert_eq!(packet.echo_seq_no(), ECHO_SEQ);
        assert!(packet.verify_checksum());

        let datagram = raw(&request);
        assert_eq!(
            decode_echo(&datagram, Icmpv4Message::EchoRequest).unwrap(),
            Echo::Payload(b"payload")
        );
    }

    #[test]
    fn test_own_direction_is_skipped() {
        let datagram = raw(&encode_echo(b"payload", true));
        assert_eq!(
            decode_echo(&datagram, Icmpv4Message::EchoReply).unwrap(),
            Echo::Foreign
        );
    }

    #[test]
    fn test_foreign_ident_is_skipped() {
        let repr = Icmpv4Repr::EchoReply {
            ident: 0x1234,
            seq_no: 7,
            data: b"ping",
        };
        let mut icmp = vec![0u8; repr.buffer_len()];
        repr.emit(
            &mut Icmpv4Packet::new_unchecked(&mut icmp),
            &ChecksumCapabilities::default(),
        );
        assert_eq!(
            decode_echo(&raw(&icmp), Icmpv4Message::EchoReply).unwrap(),
            Echo::Foreign
        );
    }

    #[test]
    fn test_other_icmp_types_are_errors() {
        // destination unreachable, port unreachable
        let icmp = [3u8, 3, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_echo(&raw(&icmp), Icmpv4Message::EchoReply),
            Err(TunnelError::UnexpectedIcmp(3))
        ));
    }

    #[test]
    fn test_short_datagram_is_skipped() {
        assert_eq!(
            decode_echo(&[0x45, 0, 0], Icmpv4Message::EchoReply).unwrap(),
            Echo::Foreign
        );
    }
}
