use std::fmt;

use crate::checksum::Checksummer;

use super::IpError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub fn from_u8(value: u8) -> TcpFlags {
        TcpFlags(value)
    }

    #[cfg(test)]
    pub fn to_u8(self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::FIN, "FIN"),
            (Self::SYN, "SYN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
            (Self::ECE, "ECE"),
            (Self::CWR, "CWR"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

pub struct TcpSegment<'a> {
    data: &'a mut [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn from_data(data: &mut [u8]) -> Result<TcpSegment<'_>, IpError> {
        if data.len() < 20 {
            return Err("Not enough data for TCP header".into());
        }
        let data_offset = ((data[12] >> 4) & 0x0f) as usize * 4;
        if data_offset > data.len() {
            Err("TCP data offset overflow".into())
        } else if data_offset < 20 {
            Err("TCP data offset folds into the header".into())
        } else {
            Ok(TcpSegment { data })
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.data[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.data[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_u8(self.data[13])
    }

    pub fn reset_checksum(&mut self, pseudo_sum: u32, checksummer: &Checksummer) {
        self.data[16..18].fill(0);
        let checksum = checksummer.checksum(pseudo_sum, self.data);
        self.data[16..18].copy_from_slice(&checksum);
    }
}

pub struct UdpDatagram<'a> {
    data: &'a mut [u8],
}

impl<'a> UdpDatagram<'a> {
    pub const HEADER_LENGTH: usize = 8;

    pub fn from_data(data: &mut [u8]) -> Result<UdpDatagram<'_>, IpError> {
        if data.len() < Self::HEADER_LENGTH {
            return Err("Not enough data for UDP header".into());
        }
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length < Self::HEADER_LENGTH {
            Err("UDP length folds into the header".into())
        } else if length > data.len() {
            Err("UDP length overflow".into())
        } else {
            Ok(UdpDatagram {
                data: &mut data[..length],
            })
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[Self::HEADER_LENGTH..]
    }

    /// Writes a UDP header in front of `dest[8..]`, which must already contain the payload.
    pub fn write_header(
        dest: &mut [u8],
        src_port: u16,
        dst_port: u16,
        pseudo_sum: u32,
        checksummer: &Checksummer,
    ) -> Result<(), IpError> {
        if dest.len() < Self::HEADER_LENGTH {
            return Err("Not enough space to add UDP header".into());
        }
        let length = u16::try_from(dest.len()).map_err(|_| "UDP datagram is too large")?;
        dest[0..2].copy_from_slice(&src_port.to_be_bytes());
        dest[2..4].copy_from_slice(&dst_port.to_be_bytes());
        dest[4..6].copy_from_slice(&length.to_be_bytes());
        dest[6..8].fill(0);
        let checksum = checksummer.checksum(pseudo_sum, dest);
        // A zero checksum means "no checksum" in UDP.
        let checksum = if checksum == [0, 0] {
            [0xff, 0xff]
        } else {
            checksum
        };
        dest[6..8].copy_from_slice(&checksum);
        Ok(())
    }
}

/// ICMP or ICMPv6 message; both share the type, code and checksum layout.
pub struct IcmpMessage<'a> {
    data: &'a mut [u8],
}

impl<'a> IcmpMessage<'a> {
    pub const ECHO_REPLY: u8 = 0;
    pub const ECHO_REQUEST: u8 = 8;
    pub const V6_ECHO_REQUEST: u8 = 128;
    pub const V6_ECHO_REPLY: u8 = 129;

    pub fn from_data(data: &mut [u8]) -> Result<IcmpMessage<'_>, IpError> {
        // Type, code, checksum and the 4-byte rest of header.
        if data.len() < 8 {
            Err("Not enough data for ICMP header".into())
        } else {
            Ok(IcmpMessage { data })
        }
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn set_type(&mut self, icmp_type: u8) {
        self.data[0] = icmp_type;
    }

    /// ICMPv4 passes 0 as `pseudo_sum`, ICMPv6 includes the IPv6 pseudo header.
    pub fn reset_checksum(&mut self, pseudo_sum: u32, checksummer: &Checksummer) {
        self.data[2..4].fill(0);
        let checksum = checksummer.checksum(pseudo_sum, self.data);
        self.data[2..4].copy_from_slice(&checksum);
    }
}
