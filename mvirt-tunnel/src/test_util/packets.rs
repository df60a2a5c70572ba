//! IP packet builders for tests
//!
//! Uses smoltcp for header construction, matching how the classifier decodes.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, UdpPacket, UdpRepr,
};
use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 header size (without options)
pub const IPV4_HDR_SIZE: usize = 20;

/// IPv6 fixed header size
pub const IPV6_HDR_SIZE: usize = 40;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

const TCP_FLAG_SYN: u8 = 0x02;

/// Build an IPv4 packet carrying `payload` as protocol `protocol`.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let ip_repr = Ipv4Repr {
        src_addr: src.into(),
        dst_addr: dst.into(),
        next_header: IpProtocol::from(protocol),
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let mut packet = vec![0u8; IPV4_HDR_SIZE + payload.len()];
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    ip_packet.payload_mut().copy_from_slice(payload);
    packet
}

/// Build a bare TCP header with the given flags byte.
pub fn tcp_header(src_port: u16, dst_port: u16, flags: u8) -> [u8; TCP_HDR_SIZE] {
    let mut tcp = [0u8; TCP_HDR_SIZE];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&1u32.to_be_bytes());
    // data offset: 5 words
    tcp[12] = 0x50;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
    tcp
}

/// Build a 40-byte IPv4 TCP SYN.
pub fn ipv4_tcp_syn(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    ipv4_packet(src, dst, 6, &tcp_header(src_port, dst_port, TCP_FLAG_SYN))
}

/// Build a 28-byte IPv4 TCP SYN whose TCP header is cut after the sequence number.
pub fn ipv4_tcp_syn_truncated(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    ipv4_packet(src, dst, 6, &tcp_header(src_port, dst_port, TCP_FLAG_SYN)[..8])
}

/// Build an IPv4 UDP datagram.
pub fn ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut udp = vec![0u8; UDP_HDR_SIZE + data.len()];
    let udp_repr = UdpRepr { src_port, dst_port };
    udp_repr.emit(
        &mut UdpPacket::new_unchecked(&mut udp),
        &IpAddress::Ipv4(src.into()),
        &IpAddress::Ipv4(dst.into()),
        data.len(),
        |buf| buf.copy_from_slice(data),
        &ChecksumCapabilities::default(),
    );
    ipv4_packet(src, dst, 17, &udp)
}

/// Build an IPv6 UDP datagram.
pub fn ipv6_udp(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    data: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + data.len();
    let ip_repr = Ipv6Repr {
        src_addr: src.into(),
        dst_addr: dst.into(),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut packet = vec![0u8; IPV6_HDR_SIZE + udp_len];
    let mut ip_packet = Ipv6Packet::new_unchecked(&mut packet);
    ip_repr.emit(&mut ip_packet);

    let udp_repr = UdpRepr { src_port, dst_port };
    udp_repr.emit(
        &mut UdpPacket::new_unchecked(ip_packet.payload_mut()),
        &IpAddress::Ipv6(src.into()),
        &IpAddress::Ipv6(dst.into()),
        data.len(),
        |buf| buf.copy_from_slice(data),
        &ChecksumCapabilities::default(),
    );
    packet
}
