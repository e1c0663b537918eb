// Packet builders and checks shared by unit tests.

use std::net::{IpAddr, SocketAddr};

use crate::checksum::{sum_compat, Checksummer};

use super::{IcmpMessage, TcpFlags, TransportProtocolType};

fn ip_header(
    src: IpAddr,
    dst: IpAddr,
    protocol: TransportProtocolType,
    payload_len: usize,
    ttl: u8,
) -> Vec<u8> {
    let checksummer = Checksummer::default();
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut header = vec![0u8; 20];
            header[0] = 0x45;
            header[2..4].copy_from_slice(&(20 + payload_len as u16).to_be_bytes());
            header[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
            // Don't fragment.
            header[6] = 0x40;
            header[8] = ttl;
            header[9] = protocol.to_u8();
            header[12..16].copy_from_slice(&src.octets());
            header[16..20].copy_from_slice(&dst.octets());
            let checksum = checksummer.checksum(0, &header);
            header[10..12].copy_from_slice(&checksum);
            header
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut header = vec![0u8; 40];
            header[0] = 0x60;
            header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
            header[6] = protocol.to_u8();
            header[7] = ttl;
            header[8..24].copy_from_slice(&src.octets());
            header[24..40].copy_from_slice(&dst.octets());
            header
        }
        _ => panic!("Mixed address families"),
    }
}

fn pseudo_sum(packet: &[u8], protocol: TransportProtocolType, transport_len: usize) -> u32 {
    let addrs = if packet[0] >> 4 == 4 {
        &packet[12..20]
    } else {
        &packet[8..40]
    };
    sum_compat(addrs) + protocol.to_u8() as u32 + transport_len as u32
}

fn finish_transport(
    mut packet: Vec<u8>,
    protocol: TransportProtocolType,
    checksum_offset: usize,
    with_pseudo_header: bool,
) -> Vec<u8> {
    let header_len = if packet[0] >> 4 == 4 { 20 } else { 40 };
    let transport_len = packet.len() - header_len;
    let pseudo = if with_pseudo_header {
        pseudo_sum(&packet, protocol, transport_len)
    } else {
        0
    };
    let checksum = Checksummer::default().checksum(pseudo, &packet[header_len..]);
    packet[header_len + checksum_offset..header_len + checksum_offset + 2]
        .copy_from_slice(&checksum);
    packet
}

pub fn ip_tcp(src: SocketAddr, dst: SocketAddr, flags: TcpFlags, ttl: u8) -> Vec<u8> {
    let mut packet = ip_header(src.ip(), dst.ip(), TransportProtocolType::TCP, 24, ttl);
    let mut tcp = vec![0u8; 24];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&0x01020304u32.to_be_bytes());
    tcp[12] = 0x50;
    tcp[13] = flags.to_u8();
    tcp[14..16].copy_from_slice(&0xfaf0u16.to_be_bytes());
    tcp[20..24].copy_from_slice(b"data");
    packet.extend_from_slice(&tcp);
    finish_transport(packet, TransportProtocolType::TCP, 16, true)
}

pub fn ipv4_tcp(src: SocketAddr, dst: SocketAddr, flags: TcpFlags, ttl: u8) -> Vec<u8> {
    assert!(src.is_ipv4() && dst.is_ipv4());
    ip_tcp(src, dst, flags, ttl)
}

pub fn ip_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8], ttl: u8) -> Vec<u8> {
    let mut packet = ip_header(
        src.ip(),
        dst.ip(),
        TransportProtocolType::UDP,
        8 + payload.len(),
        ttl,
    );
    packet.extend_from_slice(&src.port().to_be_bytes());
    packet.extend_from_slice(&dst.port().to_be_bytes());
    packet.extend_from_slice(&(8 + payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);
    finish_transport(packet, TransportProtocolType::UDP, 6, true)
}

pub fn ipv6_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8], hop_limit: u8) -> Vec<u8> {
    assert!(src.is_ipv6() && dst.is_ipv6());
    ip_udp(src, dst, payload, hop_limit)
}

pub fn icmp_echo(src: IpAddr, dst: IpAddr, icmp_type: u8, code: u8, ttl: u8) -> Vec<u8> {
    let protocol = if src.is_ipv4() {
        TransportProtocolType::ICMP
    } else {
        TransportProtocolType::IPV6_ICMP
    };
    let mut packet = ip_header(src, dst, protocol, 12, ttl);
    packet.extend_from_slice(&[icmp_type, code, 0, 0, 0x12, 0x34, 0x00, 0x07]);
    packet.extend_from_slice(b"ping");
    finish_transport(packet, protocol, 2, protocol == TransportProtocolType::IPV6_ICMP)
}

pub fn icmpv4_echo_request(src: IpAddr, dst: IpAddr, ttl: u8) -> Vec<u8> {
    icmp_echo(src, dst, IcmpMessage::ECHO_REQUEST, 0, ttl)
}

/// Independently verifies the IP header checksum (IPv4) and the transport checksum.
pub fn checksums_valid(packet: &[u8]) -> bool {
    let checksummer = Checksummer::default();
    let (header_len, protocol) = if packet[0] >> 4 == 4 {
        let header_len = (packet[0] & 0x0f) as usize * 4;
        if checksummer.checksum(0, &packet[..header_len]) != [0, 0] {
            return false;
        }
        (header_len, TransportProtocolType::from_u8(packet[9]))
    } else {
        (40, TransportProtocolType::from_u8(packet[6]))
    };
    let transport = &packet[header_len..];
    let pseudo = if protocol == TransportProtocolType::ICMP {
        0
    } else {
        pseudo_sum(packet, protocol, transport.len())
    };
    checksummer.checksum(pseudo, transport) == [0, 0]
}

pub fn src(packet: &[u8]) -> SocketAddr {
    endpoint(packet, true)
}

pub fn dst(packet: &[u8]) -> SocketAddr {
    endpoint(packet, false)
}

fn endpoint(packet: &[u8], source: bool) -> SocketAddr {
    let (ip, header_len): (IpAddr, usize) = if packet[0] >> 4 == 4 {
        let offset = if source { 12 } else { 16 };
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&packet[offset..offset + 4]);
        (octets.into(), (packet[0] & 0x0f) as usize * 4)
    } else {
        let offset = if source { 8 } else { 24 };
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&packet[offset..offset + 16]);
        (octets.into(), 40)
    };
    let port_offset = header_len + if source { 0 } else { 2 };
    let port = u16::from_be_bytes([packet[port_offset], packet[port_offset + 1]]);
    SocketAddr::new(ip, port)
}

pub fn ttl(packet: &[u8]) -> u8 {
    if packet[0] >> 4 == 4 {
        packet[8]
    } else {
        packet[7]
    }
}
