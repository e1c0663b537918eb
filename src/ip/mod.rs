use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use crate::checksum::Checksummer;

mod transport;

#[cfg(test)]
pub mod testing;

pub use transport::{IcmpMessage, TcpFlags, TcpSegment, UdpDatagram};

// Set to 0 to stop decreasing TTL or Hop Limit.
const TTL_HOP_DECREMENT: u8 = 1;

pub const DEFAULT_RESPONSE_TTL: u8 = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransportProtocolType(u8);

impl TransportProtocolType {
    pub const ICMP: TransportProtocolType = TransportProtocolType(1);
    pub const TCP: TransportProtocolType = TransportProtocolType(6);
    pub const UDP: TransportProtocolType = TransportProtocolType(17);
    pub const IPV6_FRAGMENT: TransportProtocolType = TransportProtocolType(44);
    pub const IPV6_ICMP: TransportProtocolType = TransportProtocolType(58);

    pub fn from_u8(value: u8) -> TransportProtocolType {
        TransportProtocolType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TransportProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6_FRAGMENT => write!(f, "IPv6-Frag"),
            Self::IPV6_ICMP => write!(f, "IPv6-ICMP"),
            _ => write!(f, "Unknown IP transport protocol or header type {}", self.0),
        }
    }
}

/// Mutable view of an IPv4 packet, trimmed to the length from its header.
pub struct Ipv4Packet<'a> {
    data: &'a mut [u8],
}

impl<'a> Ipv4Packet<'a> {
    const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;
    const FRAGMENT_MF_MASK: u16 = 1 << 13;
    pub const HEADER_LENGTH: usize = 20;

    pub fn from_data(data: &mut [u8]) -> Result<Ipv4Packet<'_>, IpError> {
        if data.len() < Self::HEADER_LENGTH {
            return Err("Not enough bytes in IPv4 header".into());
        }
        if data[0] >> 4 != 4 {
            return Err("IP version is not 4".into());
        }
        let header_length = Self::header_length(data);
        if header_length < Self::HEADER_LENGTH {
            return Err("IPv4 header length is too small".into());
        }
        if data.len() < header_length {
            return Err("IPv4 header length overflow".into());
        }
        let total_length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_length < header_length {
            return Err("IPv4 total length folds into the header".into());
        }
        if total_length > data.len() {
            return Err("IPv4 total length overflow".into());
        }
        Ok(Ipv4Packet {
            data: &mut data[..total_length],
        })
    }

    fn header_length(data: &[u8]) -> usize {
        (data[0] & 0x0f) as usize * 4
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let mut src_addr = [0u8; 4];
        src_addr.copy_from_slice(&self.data[12..16]);
        Ipv4Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let mut dst_addr = [0u8; 4];
        dst_addr.copy_from_slice(&self.data[16..20]);
        Ipv4Addr::from(dst_addr)
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.data[12..16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.data[16..20].copy_from_slice(&addr.octets());
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        TransportProtocolType::from_u8(self.data[9])
    }

    pub fn more_fragments(&self) -> bool {
        let fragment = u16::from_be_bytes([self.data[6], self.data[7]]);
        fragment & Self::FRAGMENT_MF_MASK == Self::FRAGMENT_MF_MASK
    }

    pub fn fragment_offset(&self) -> u16 {
        let fragment = u16::from_be_bytes([self.data[6], self.data[7]]);
        fragment & Self::FRAGMENT_OFFSET_MASK
    }

    pub fn is_fragmented(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    pub fn validate_checksum(&self, checksummer: &Checksummer) -> bool {
        checksummer.checksum(0, &self.data[..Self::header_length(self.data)]) == [0, 0]
    }

    pub fn dec_ttl(&mut self) {
        self.data[8] = self.data[8].saturating_sub(TTL_HOP_DECREMENT);
    }

    pub fn reset_checksum(&mut self, checksummer: &Checksummer) {
        let header_length = Self::header_length(self.data);
        self.data[10..12].fill(0);
        let checksum = checksummer.checksum(0, &self.data[..header_length]);
        self.data[10..12].copy_from_slice(&checksum);
    }

    pub fn pseudo_sum(&self, checksummer: &Checksummer) -> u32 {
        let transport_length = self.payload().len() as u16;
        let mut sum = checksummer.sum(&self.data[12..20]);
        sum += self.transport_protocol().to_u8() as u32;
        sum += transport_length as u32;
        sum
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[Self::header_length(self.data)..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_length = Self::header_length(self.data);
        &mut self.data[header_length..]
    }

    /// Writes an unfragmented IPv4 header for a datagram of `payload_length` bytes.
    pub fn write_header(
        dest: &mut [u8],
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        protocol: TransportProtocolType,
        payload_length: usize,
        identification: u16,
        checksummer: &Checksummer,
    ) -> Result<(), IpError> {
        if dest.len() != Self::HEADER_LENGTH {
            return Err("Destination slice for IPv4 header needs exactly 20 bytes".into());
        }
        let total_length = u16::try_from(payload_length + Self::HEADER_LENGTH)
            .map_err(|_| "IPv4 payload is too large")?;
        dest[0] = (4 << 4) | 5;
        dest[1] = 0;
        dest[2..4].copy_from_slice(&total_length.to_be_bytes());
        dest[4..6].copy_from_slice(&identification.to_be_bytes());
        dest[6..8].fill(0);
        dest[8] = DEFAULT_RESPONSE_TTL;
        dest[9] = protocol.to_u8();
        dest[10..12].fill(0);
        dest[12..16].copy_from_slice(&src_addr.octets());
        dest[16..20].copy_from_slice(&dst_addr.octets());
        let checksum = checksummer.checksum(0, dest);
        dest[10..12].copy_from_slice(&checksum);
        Ok(())
    }
}

/// Mutable view of an IPv6 packet, trimmed to the payload length from its header.
/// Extension headers are not parsed; the next header field is treated as the transport protocol.
pub struct Ipv6Packet<'a> {
    data: &'a mut [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub const HEADER_LENGTH: usize = 40;

    pub fn from_data(data: &mut [u8]) -> Result<Ipv6Packet<'_>, IpError> {
        if data.len() < Self::HEADER_LENGTH {
            return Err("Not enough bytes in IPv6 header".into());
        }
        if data[0] >> 4 != 6 {
            return Err("IP version is not 6".into());
        }
        let payload_length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if Self::HEADER_LENGTH + payload_length > data.len() {
            return Err("IPv6 payload length overflow".into());
        }
        Ok(Ipv6Packet {
            data: &mut data[..Self::HEADER_LENGTH + payload_length],
        })
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut src_addr = [0u8; 16];
        src_addr.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut dst_addr = [0u8; 16];
        dst_addr.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(dst_addr)
    }

    pub fn set_src_addr(&mut self, addr: Ipv6Addr) {
        self.data[8..24].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv6Addr) {
        self.data[24..40].copy_from_slice(&addr.octets());
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn next_header(&self) -> TransportProtocolType {
        TransportProtocolType::from_u8(self.data[6])
    }

    pub fn dec_hop_limit(&mut self) {
        self.data[7] = self.data[7].saturating_sub(TTL_HOP_DECREMENT);
    }

    pub fn pseudo_sum(&self, checksummer: &Checksummer) -> u32 {
        let transport_length = self.payload().len() as u32;
        let mut sum = checksummer.sum(&self.data[8..40]);
        sum += self.next_header().to_u8() as u32;
        sum += checksummer.sum(&transport_length.to_be_bytes());
        sum
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[Self::HEADER_LENGTH..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[Self::HEADER_LENGTH..]
    }

    pub fn write_header(
        dest: &mut [u8],
        src_addr: Ipv6Addr,
        dst_addr: Ipv6Addr,
        protocol: TransportProtocolType,
        payload_length: usize,
    ) -> Result<(), IpError> {
        if dest.len() != Self::HEADER_LENGTH {
            return Err("Destination slice for IPv6 header needs exactly 40 bytes".into());
        }
        let payload_length =
            u16::try_from(payload_length).map_err(|_| "IPv6 payload is too large")?;
        // Keep flow label and traffic class empty.
        dest[0..4].copy_from_slice(&(6u32 << 28).to_be_bytes());
        dest[4..6].copy_from_slice(&payload_length.to_be_bytes());
        dest[6] = protocol.to_u8();
        dest[7] = DEFAULT_RESPONSE_TTL;
        dest[8..24].copy_from_slice(&src_addr.octets());
        dest[24..40].copy_from_slice(&dst_addr.octets());
        Ok(())
    }
}

pub enum IpPacket<'a> {
    V4(Ipv4Packet<'a>),
    V6(Ipv6Packet<'a>),
}

impl<'a> IpPacket<'a> {
    pub fn from_data(data: &mut [u8]) -> Result<IpPacket<'_>, IpError> {
        if data.is_empty() {
            return Err("IP packet is empty, cannot extract header data".into());
        }
        match data[0] >> 4 {
            4 => Ok(IpPacket::V4(Ipv4Packet::from_data(data)?)),
            6 => Ok(IpPacket::V6(Ipv6Packet::from_data(data)?)),
            _ => Err("Unsupported IP protocol version".into()),
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            IpPacket::V4(packet) => packet.data(),
            IpPacket::V6(packet) => packet.data(),
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match self {
            IpPacket::V4(packet) => IpAddr::V4(packet.src_addr()),
            IpPacket::V6(packet) => IpAddr::V6(packet.src_addr()),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpPacket::V4(packet) => IpAddr::V4(packet.dst_addr()),
            IpPacket::V6(packet) => IpAddr::V6(packet.dst_addr()),
        }
    }

    pub fn set_src_addr(&mut self, addr: IpAddr) -> Result<(), IpError> {
        match (self, addr) {
            (IpPacket::V4(packet), IpAddr::V4(addr)) => packet.set_src_addr(addr),
            (IpPacket::V6(packet), IpAddr::V6(addr)) => packet.set_src_addr(addr),
            _ => return Err("Source address family doesn't match IP version".into()),
        }
        Ok(())
    }

    pub fn set_dst_addr(&mut self, addr: IpAddr) -> Result<(), IpError> {
        match (self, addr) {
            (IpPacket::V4(packet), IpAddr::V4(addr)) => packet.set_dst_addr(addr),
            (IpPacket::V6(packet), IpAddr::V6(addr)) => packet.set_dst_addr(addr),
            _ => return Err("Destination address family doesn't match IP version".into()),
        }
        Ok(())
    }

    pub fn ttl(&self) -> u8 {
        match self {
            IpPacket::V4(packet) => packet.ttl(),
            IpPacket::V6(packet) => packet.hop_limit(),
        }
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        match self {
            IpPacket::V4(packet) => packet.transport_protocol(),
            IpPacket::V6(packet) => packet.next_header(),
        }
    }

    pub fn dec_ttl(&mut self) {
        match self {
            IpPacket::V4(packet) => packet.dec_ttl(),
            IpPacket::V6(packet) => packet.dec_hop_limit(),
        }
    }

    pub fn reset_checksum(&mut self, checksummer: &Checksummer) {
        match self {
            IpPacket::V4(packet) => packet.reset_checksum(checksummer),
            // IPv6 has no header checksum.
            IpPacket::V6(_) => {}
        }
    }

    pub fn pseudo_sum(&self, checksummer: &Checksummer) -> u32 {
        match self {
            IpPacket::V4(packet) => packet.pseudo_sum(checksummer),
            IpPacket::V6(packet) => packet.pseudo_sum(checksummer),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            IpPacket::V4(packet) => packet.payload(),
            IpPacket::V6(packet) => packet.payload(),
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self {
            IpPacket::V4(packet) => packet.payload_mut(),
            IpPacket::V6(packet) => packet.payload_mut(),
        }
    }

    fn ports(&self) -> Option<(u16, u16)> {
        let protocol = self.transport_protocol();
        let payload = self.payload();
        if (protocol == TransportProtocolType::TCP || protocol == TransportProtocolType::UDP)
            && payload.len() >= 4
        {
            Some((
                u16::from_be_bytes([payload[0], payload[1]]),
                u16::from_be_bytes([payload[2], payload[3]]),
            ))
        } else {
            None
        }
    }
}

impl fmt::Display for IpPacket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpPacket::V4(_) => write!(f, "IPv4 ")?,
            IpPacket::V6(_) => write!(f, "IPv6 ")?,
        }
        match self.ports() {
            Some((src_port, dst_port)) => write!(
                f,
                "{} {}:{} -> {}:{}",
                self.transport_protocol(),
                self.src_addr(),
                src_port,
                self.dst_addr(),
                dst_port
            )?,
            None => write!(
                f,
                "{} {} -> {}",
                self.transport_protocol(),
                self.src_addr(),
                self.dst_addr()
            )?,
        }
        match self {
            IpPacket::V4(packet) => write!(f, " L={} TTL={}", packet.data.len(), packet.ttl()),
            IpPacket::V6(packet) => write!(f, " L={} H={}", packet.data.len(), packet.hop_limit()),
        }
    }
}

#[derive(Debug)]
pub enum IpError {
    Internal(&'static str),
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for IpError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
        }
    }
}

impl From<&'static str> for IpError {
    fn from(msg: &'static str) -> IpError {
        Self::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::testing;

    #[test]
    fn parse_ipv4_trims_padding() {
        let mut packet = testing::ipv4_tcp(
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            TcpFlags::SYN,
            64,
        );
        let len = packet.len();
        packet.extend_from_slice(&[0u8; 6]);
        let ip = Ipv4Packet::from_data(&mut packet).unwrap();
        assert_eq!(ip.data().len(), len);
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.transport_protocol(), TransportProtocolType::TCP);
        assert!(!ip.is_fragmented());
        assert!(ip.validate_checksum(&Checksummer::default()));
    }

    #[test]
    fn reject_truncated_ipv4() {
        let mut packet = testing::ipv4_tcp(
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            TcpFlags::SYN,
            64,
        );
        packet.truncate(30);
        assert!(Ipv4Packet::from_data(&mut packet).is_err());
        assert!(Ipv4Packet::from_data(&mut [0x45u8; 10]).is_err());
        // IHL below 5.
        let mut short_ihl = [0u8; 20];
        short_ihl[0] = 0x44;
        short_ihl[3] = 20;
        assert!(Ipv4Packet::from_data(&mut short_ihl).is_err());
    }

    #[test]
    fn ipv4_fragment_flags() {
        let mut packet = testing::ipv4_tcp(
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            TcpFlags::SYN,
            64,
        );
        packet[6] = 0x20;
        let ip = Ipv4Packet::from_data(&mut packet).unwrap();
        assert!(ip.more_fragments());
        assert!(ip.is_fragmented());

        packet[6] = 0x40;
        packet[7] = 0x00;
        let ip = Ipv4Packet::from_data(&mut packet).unwrap();
        assert!(!ip.is_fragmented());

        packet[6] = 0x00;
        packet[7] = 0x10;
        let ip = Ipv4Packet::from_data(&mut packet).unwrap();
        assert_eq!(ip.fragment_offset(), 0x10);
        assert!(ip.is_fragmented());
    }

    #[test]
    fn ttl_decrement_and_checksum() {
        let checksummer = Checksummer::default();
        let mut packet = testing::ipv4_tcp(
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            TcpFlags::SYN,
            1,
        );
        let mut ip = IpPacket::from_data(&mut packet).unwrap();
        ip.dec_ttl();
        ip.dec_ttl();
        assert_eq!(ip.ttl(), 0);
        ip.set_src_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
            .unwrap();
        assert!(ip
            .set_dst_addr(IpAddr::V6(Ipv6Addr::LOCALHOST))
            .is_err());
        ip.reset_checksum(&checksummer);
        match ip {
            IpPacket::V4(ip) => assert!(ip.validate_checksum(&checksummer)),
            IpPacket::V6(_) => panic!("expected IPv4"),
        }
    }

    #[test]
    fn parse_ipv6() {
        let mut packet = testing::ipv6_udp(
            "[fd00::1]:5353".parse().unwrap(),
            "[fd00::2]:53".parse().unwrap(),
            b"query",
            3,
        );
        let ip = IpPacket::from_data(&mut packet).unwrap();
        assert_eq!(ip.ttl(), 3);
        assert_eq!(ip.transport_protocol(), TransportProtocolType::UDP);
        assert_eq!(ip.payload().len(), 8 + 5);
        assert_eq!(
            ip.to_string(),
            "IPv6 UDP fd00::1:5353 -> fd00::2:53 L=53 H=3"
        );

        let mut truncated = packet[..45].to_vec();
        assert!(IpPacket::from_data(&mut truncated).is_err());
    }

    #[test]
    fn unsupported_version() {
        let mut packet = [0x50u8; 40];
        assert!(IpPacket::from_data(&mut packet).is_err());
        assert!(IpPacket::from_data(&mut []).is_err());
    }

    #[test]
    fn written_headers_are_valid() {
        let checksummer = Checksummer::default();
        let mut header = [0u8; 20];
        Ipv4Packet::write_header(
            &mut header,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            TransportProtocolType::UDP,
            0,
            0x1234,
            &checksummer,
        )
        .unwrap();
        let ip = Ipv4Packet::from_data(&mut header).unwrap();
        assert!(ip.validate_checksum(&checksummer));
        assert_eq!(ip.ttl(), DEFAULT_RESPONSE_TTL);
        assert!(Ipv4Packet::write_header(
            &mut [0u8; 20],
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            TransportProtocolType::UDP,
            65535,
            0,
            &checksummer,
        )
        .is_err());

        let mut header = [0u8; 40];
        Ipv6Packet::write_header(
            &mut header,
            Ipv6Addr::LOCALHOST,
            Ipv6Addr::UNSPECIFIED,
            TransportProtocolType::UDP,
            0,
        )
        .unwrap();
        let ip = Ipv6Packet::from_data(&mut header).unwrap();
        assert_eq!(ip.src_addr(), Ipv6Addr::LOCALHOST);
        assert_eq!(ip.hop_limit(), DEFAULT_RESPONSE_TTL);
    }
}
