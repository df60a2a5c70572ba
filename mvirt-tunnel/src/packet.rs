//! Packet classification using smoltcp
//!
//! A [`Packet`] is a borrowed, read-only view over one received buffer. It is
//! only constructed when the first nibble announces IPv4 or IPv6 and the
//! network header decodes cleanly; anything else is "not a packet". The
//! transport layer (ports, TCP flags) is decoded lazily and is optional, so a
//! truncated TCP/UDP header still yields a usable network-layer view.

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP version of a parsed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// Transport protocol carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    /// ICMP or ICMPv6.
    Icmp,
    Other(u8),
}

impl Protocol {
    fn from_next_header(proto: IpProtocol) -> Self {
        match proto {
            IpProtocol::Tcp => Protocol::Tcp,
            IpProtocol::Udp => Protocol::Udp,
            IpProtocol::Icmp | IpProtocol::Icmpv6 => Protocol::Icmp,
            other => Protocol::Other(u8::from(other)),
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other(_) => "ip",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Other(n) => write!(f, "Proto({n})"),
        }
    }
}

/// TCP control flags relevant for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, c) in [(self.syn, 'S'), (self.ack, 'A'), (self.fin, 'F'), (self.rst, 'R')] {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Read-only view over a received IP packet.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    version: IpVersion,
    src: IpAddr,
    dst: IpAddr,
    protocol: Protocol,
    /// Network-layer payload (the transport header and beyond).
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse a buffer as an IP packet.
    ///
    /// Only the first nibble decides which decoder runs; buffers that do not
    /// start with 0x4 or 0x6 are rejected without any decode attempt.
    pub fn parse(buf: &'a [u8]) -> Option<Packet<'a>> {
        match buf.first()? >> 4 {
            4 => Self::parse_v4(buf),
            6 => Self::parse_v6(buf),
            _ => None,
        }
    }

    fn parse_v4(buf: &'a [u8]) -> Option<Packet<'a>> {
        let ipv4 = Ipv4Packet::new_checked(buf).ok()?;
        let header_len = ipv4.header_len() as usize;
        let total_len = ipv4.total_len() as usize;
        if total_len < header_len {
            return None;
        }
        Some(Packet {
            version: IpVersion::V4,
            src: IpAddr::V4(Ipv4Addr::from(ipv4.src_addr())),
            dst: IpAddr::V4(Ipv4Addr::from(ipv4.dst_addr())),
            protocol: Protocol::from_next_header(ipv4.next_header()),
            payload: &buf[header_len..total_len],
        })
    }

    fn parse_v6(buf: &'a [u8]) -> Option<Packet<'a>> {
        const HEADER_LEN: usize = 40;
        let ipv6 = Ipv6Packet::new_checked(buf).ok()?;
        let payload_len = ipv6.payload_len() as usize;
        Some(Packet {
            version: IpVersion::V6,
            src: IpAddr::V6(Ipv6Addr::from(ipv6.src_addr())),
            dst: IpAddr::V6(Ipv6Addr::from(ipv6.dst_addr())),
            protocol: Protocol::from_next_header(ipv6.next_header()),
            payload: buf.get(HEADER_LEN..HEADER_LEN + payload_len)?,
        })
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Tunnel-internal source address.
    pub fn src(&self) -> IpAddr {
        self.src
    }

    /// Tunnel-internal destination address.
    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Source and destination ports, if this is a TCP or UDP packet with an
    /// intact transport header.
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.protocol {
            Protocol::Tcp => {
                let tcp = TcpPacket::new_checked(self.payload).ok()?;
                Some((tcp.src_port(), tcp.dst_port()))
            }
            Protocol::Udp => {
                let udp = UdpPacket::new_checked(self.payload).ok()?;
                Some((udp.src_port(), udp.dst_port()))
            }
            _ => None,
        }
    }

    /// TCP flags, if this is a TCP packet with an intact header.
    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        if self.protocol != Protocol::Tcp {
            return None;
        }
        let tcp = TcpPacket::new_checked(self.payload).ok()?;
        Some(TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        })
    }

    /// Broadcast/multicast noise that is never worth forwarding.
    ///
    /// IPv4: limited broadcast or a destination in 224.0.0.0/3.
    /// IPv6: any multicast destination (ff00::/8).
    pub fn is_chatter(&self) -> bool {
        match self.dst {
            IpAddr::V4(dst) => dst.is_broadcast() || dst.octets()[0] >> 4 >= 0xe,
            IpAddr::V6(dst) => dst.octets()[0] == 0xff,
        }
    }

    /// One-line flow summary, e.g. `10.0.0.2:40000/tcp => 10.0.0.1:80/tcp [S]`.
    pub fn describe_flow(&self) -> String {
        let proto = self.protocol.short_name();
        let (src, dst) = match self.ports() {
            Some((sport, dport)) => (
                SocketAddr::new(self.src, sport).to_string(),
                SocketAddr::new(self.dst, dport).to_string(),
            ),
            None => (self.src.to_string(), self.dst.to_string()),
        };
        let flags = match self.tcp_flags() {
            Some(flags) if flags != TcpFlags::default() => format!(" [{flags}]"),
            _ => String::new(),
        };
        format!("{src}/{proto} => {dst}/{proto}{flags}")
    }

    /// Decoded layer names, e.g. `IPv4 TCP`.
    pub fn describe_layers(&self) -> String {
        format!("{} {}", self.version, self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::packets::{ipv4_packet, ipv4_tcp_syn, ipv4_udp, ipv6_udp};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);

    #[test]
    fn test_non_ip_nibbles_are_not_packets() {
        for first in [0x00u8, 0x01, 0x15, 0x20, 0x35, 0x50, 0x7f, 0x80, 0xa0, 0xf0] {
            let mut buf = ipv4_tcp_syn(CLIENT, SERVER, 40000, 80);
            buf[0] = first;
            assert!(Packet::parse(&buf).is_none(), "nibble {first:#x}");
        }
        assert!(Packet::parse(&[]).is_none());
        assert!(Packet::parse(&crate::message::HELLO).is_none());
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let buf = ipv4_tcp_syn(CLIENT, SERVER, 40000, 80);
        let packet = Packet::parse(&buf).unwrap();
        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.src(), IpAddr::V4(CLIENT));
        assert_eq!(packet.dst(), IpAddr::V4(SERVER));
        assert_eq!(packet.protocol(), Protocol::Tcp);
        assert_eq!(packet.ports(), Some((40000, 80)));
        let flags = packet.tcp_flags().unwrap();
        assert!(flags.syn);
        assert!(!flags.ack);
    }

    #[test]
    fn test_truncated_transport_header_still_parses() {
        // 20-byte IPv4 header + 8 bytes of a TCP header
        let buf = ipv4_packet(CLIENT, SERVER, 6, &[0x9c, 0x40, 0x00, 0x50, 0, 0, 0, 1]);
        assert_eq!(buf.len(), 28);
        let packet = Packet::parse(&buf).unwrap();
        assert_eq!(packet.protocol(), Protocol::Tcp);
        assert_eq!(packet.ports(), None);
        assert_eq!(packet.describe_flow(), "10.10.0.2/tcp => 10.10.0.1/tcp");
    }

    #[test]
    fn test_malformed_ipv4_is_not_a_packet() {
        let mut buf = ipv4_tcp_syn(CLIENT, SERVER, 40000, 80);
        // total length larger than the buffer
        buf[2] = 0x05;
        buf[3] = 0xdc;
        assert!(Packet::parse(&buf).is_none());

        // shorter than a minimal header
        assert!(Packet::parse(&[0x45, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "fd00::1".parse().unwrap();
        let buf = ipv6_udp(src, dst, 5353, 53, b"query");
        let packet = Packet::parse(&buf).unwrap();
        assert_eq!(packet.version(), IpVersion::V6);
        assert_eq!(packet.src(), IpAddr::V6(src));
        assert_eq!(packet.ports(), Some((5353, 53)));
        assert!(!packet.is_chatter());
    }

    #[test]
    fn test_ipv4_chatter() {
        let broadcast = ipv4_udp(CLIENT, Ipv4Addr::BROADCAST, 68, 67, b"x");
        assert!(Packet::parse(&broadcast).unwrap().is_chatter());

        for dst in [
            Ipv4Addr::new(224, 0, 0, 251),
            Ipv4Addr::new(239, 255, 255, 250),
            Ipv4Addr::new(240, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 254),
        ] {
            let buf = ipv4_udp(CLIENT, dst, 5353, 5353, b"x");
            assert!(Packet::parse(&buf).unwrap().is_chatter(), "{dst}");
        }

        for dst in [SERVER, Ipv4Addr::new(223, 255, 255, 255), Ipv4Addr::new(10, 10, 0, 255)] {
            let buf = ipv4_udp(CLIENT, dst, 5353, 5353, b"x");
            assert!(!Packet::parse(&buf).unwrap().is_chatter(), "{dst}");
        }
    }

    #[test]
    fn test_ipv6_chatter() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let mdns = ipv6_udp(src, "ff02::fb".parse().unwrap(), 5353, 5353, b"x");
        assert!(Packet::parse(&mdns).unwrap().is_chatter());

        let unicast = ipv6_udp(src, "fe80::2".parse().unwrap(), 5353, 5353, b"x");
        assert!(!Packet::parse(&unicast).unwrap().is_chatter());
    }

    #[test]
    fn test_describe() {
        let buf = ipv4_tcp_syn(CLIENT, SERVER, 40000, 80);
        let packet = Packet::parse(&buf).unwrap();
        assert_eq!(
            packet.describe_flow(),
            "10.10.0.2:40000/tcp => 10.10.0.1:80/tcp [S]"
        );
        assert_eq!(packet.describe_layers(), "IPv4 TCP");

        let buf = ipv4_packet(CLIENT, SERVER, 1, &[8, 0, 0, 0, 0, 0, 0, 0]);
        let packet = Packet::parse(&buf).unwrap();
        assert_eq!(packet.describe_flow(), "10.10.0.2/icmp => 10.10.0.1/icmp");
        assert_eq!(packet.describe_layers(), "IPv4 ICMP");
    }
}
