use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::RxError;

pub const ETH_HEADER_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
/// Ethernet plus the longest IPv4 and TCP headers.
pub const MAX_HEADERS_LEN: usize = ETH_HEADER_LEN + 60 + 60;

pub(crate) const IPV4_TOTAL_LEN_OFFSET: usize = 2;
pub(crate) const IPV4_CSUM_OFFSET: usize = 10;
pub(crate) const IPV4_SRC_OFFSET: usize = 12;
pub(crate) const IPV4_DST_OFFSET: usize = 16;
pub(crate) const TCP_SEQ_OFFSET: usize = 4;
pub(crate) const TCP_FLAGS_OFFSET: usize = 13;
pub(crate) const TCP_CSUM_OFFSET: usize = 16;
pub(crate) const UDP_CSUM_OFFSET: usize = 6;
pub(crate) const TCP_FLAG_PSH: u8 = 0x08;

/// Why a frame's headers could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooSmall,
    UnknownProtocol,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&RxError::from(*self), f)
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for RxError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::TooSmall => RxError::TooSmall,
            ParseError::UnknownProtocol => RxError::UnknownProtocol,
        }
    }
}

/// Decoded L3/L4 header fields of a reassembled frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub ip_header_len: usize,
    /// TCP header length from the data offset, or 8 for UDP.
    pub l4_header_len: usize,
    pub protocol: u8,
    pub ip_total_len: usize,
    pub tcp_seq: u32,
    /// MSS negotiated through a GSO extra-info record, 0 if none.
    pub mss: u16,
    pub payload_len: usize,
    pub split_required: bool,
}

impl PacketInfo {
    pub fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == IPPROTO_UDP
    }

    /// Offset of the transport header from the start of the frame.
    pub fn l4_offset(&self) -> usize {
        ETH_HEADER_LEN + self.ip_header_len
    }

    /// Ethernet, IP and transport headers together.
    pub fn headers_len(&self) -> usize {
        self.l4_offset() + self.l4_header_len
    }

    /// Transport segment length as carried in the pseudo header.
    pub fn l4_len(&self) -> usize {
        self.ip_total_len - self.ip_header_len
    }
}

/// Decodes the headers found in the first buffer of a frame.
///
/// All headers must be contiguous in `first`; a backend that splits them
/// across pages gets its frames delivered without offload annotations.
pub fn parse_header(first: &[u8], mss: u16) -> Result<PacketInfo, ParseError> {
    if first.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN {
        return Err(ParseError::TooSmall);
    }
    if BigEndian::read_u16(&first[12..14]) != ETHERTYPE_IPV4 {
        return Err(ParseError::UnknownProtocol);
    }
    let ip = &first[ETH_HEADER_LEN..];
    if ip[0] >> 4 != 4 {
        return Err(ParseError::UnknownProtocol);
    }
    let ip_header_len = ((ip[0] & 0x0f) as usize) * 4;
    if ip_header_len < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::UnknownProtocol);
    }
    if first.len() < ETH_HEADER_LEN + ip_header_len + TCP_MIN_HEADER_LEN {
        return Err(ParseError::TooSmall);
    }

    let protocol = ip[9];
    let l4 = &ip[ip_header_len..];
    let (l4_header_len, tcp_seq) = match protocol {
        IPPROTO_TCP => {
            let len = ((l4[12] >> 4) as usize) * 4;
            if len < TCP_MIN_HEADER_LEN {
                return Err(ParseError::UnknownProtocol);
            }
            (len, BigEndian::read_u32(&l4[TCP_SEQ_OFFSET..TCP_SEQ_OFFSET + 4]))
        }
        IPPROTO_UDP => (UDP_HEADER_LEN, 0),
        _ => return Err(ParseError::UnknownProtocol),
    };
    if first.len() < ETH_HEADER_LEN + ip_header_len + l4_header_len {
        return Err(ParseError::TooSmall);
    }

    let ip_total_len = BigEndian::read_u16(&ip[IPV4_TOTAL_LEN_OFFSET..IPV4_TOTAL_LEN_OFFSET + 2]) as usize;
    let payload_len = ip_total_len
        .checked_sub(ip_header_len + l4_header_len)
        .ok_or(ParseError::TooSmall)?;

    Ok(PacketInfo {
        ip_header_len,
        l4_header_len,
        protocol,
        ip_total_len,
        tcp_seq,
        mss,
        payload_len,
        split_required: protocol == IPPROTO_TCP && mss > 0 && payload_len > mss as usize,
    })
}

/// Destination MAC of an Ethernet frame.
pub(crate) fn destination(frame: &[u8]) -> Option<[u8; 6]> {
    frame.get(..6).and_then(|d| d.try_into().ok())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::Ipv4Addr;

    use byteorder::{BigEndian, ByteOrder};
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::tcp::TcpPacket;
    use pnet_packet::udp::UdpPacket;

    pub(crate) const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    pub(crate) const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn eth_ipv4(protocol: u8, l4_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20];
        frame[0..6].copy_from_slice(&[0x00, 0x16, 0x3e, 0x00, 0x00, 0x01]);
        frame[6..12].copy_from_slice(&[0x00, 0x16, 0x3e, 0x00, 0x00, 0x02]);
        BigEndian::write_u16(&mut frame[12..14], 0x0800);
        frame[14] = 0x45;
        BigEndian::write_u16(&mut frame[16..18], (20 + l4_len) as u16);
        frame[22] = 64;
        frame[23] = protocol;
        frame[26..30].copy_from_slice(&SRC.octets());
        frame[30..34].copy_from_slice(&DST.octets());
        let csum = pnet_packet::ipv4::checksum(&Ipv4Packet::new(&frame[14..]).unwrap());
        BigEndian::write_u16(&mut frame[24..26], csum);
        frame
    }

    fn payload(len: usize) -> impl Iterator<Item = u8> {
        (0..len).map(|i| (i * 7 + 3) as u8)
    }

    /// Ethernet + IPv4 + TCP frame with a valid checksum.
    pub(crate) fn tcp_frame(payload_len: usize, seq: u32, flags: u8) -> Vec<u8> {
        let mut frame = eth_ipv4(6, 20 + payload_len);
        let mut tcp = vec![0u8; 20];
        BigEndian::write_u16(&mut tcp[0..2], 40000);
        BigEndian::write_u16(&mut tcp[2..4], 80);
        BigEndian::write_u32(&mut tcp[4..8], seq);
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        BigEndian::write_u16(&mut tcp[14..16], 65535);
        tcp.extend(payload(payload_len));
        let csum = pnet_packet::tcp::ipv4_checksum(&TcpPacket::new(&tcp).unwrap(), &SRC, &DST);
        BigEndian::write_u16(&mut tcp[16..18], csum);
        frame.extend_from_slice(&tcp);
        frame
    }

    /// Ethernet + IPv4 + UDP frame with a valid checksum.
    pub(crate) fn udp_frame(payload_len: usize) -> Vec<u8> {
        let mut frame = eth_ipv4(17, 8 + payload_len);
        let mut udp = vec![0u8; 8];
        BigEndian::write_u16(&mut udp[0..2], 5353);
        BigEndian::write_u16(&mut udp[2..4], 5353);
        BigEndian::write_u16(&mut udp[4..6], (8 + payload_len) as u16);
        udp.extend(payload(payload_len));
        let csum = pnet_packet::udp::ipv4_checksum(&UdpPacket::new(&udp).unwrap(), &SRC, &DST);
        BigEndian::write_u16(&mut udp[6..8], csum);
        frame.extend_from_slice(&udp);
        frame
    }
}

#[cfg(test)]
mod test {
    use super::testing::*;
    use super::*;

    #[test]
    fn parses_tcp() {
        let frame = tcp_frame(3000, 1000, TCP_FLAG_PSH | 0x10);
        let info = parse_header(&frame, 1460).unwrap();
        assert!(info.is_tcp());
        assert_eq!(info.ip_header_len, 20);
        assert_eq!(info.l4_header_len, 20);
        assert_eq!(info.ip_total_len, 3040);
        assert_eq!(info.payload_len, 3000);
        assert_eq!(info.tcp_seq, 1000);
        assert!(info.split_required);
        assert_eq!(info.headers_len(), 54);

        assert!(!parse_header(&frame, 0).unwrap().split_required);
        assert!(!parse_header(&frame, 3000).unwrap().split_required);
    }

    #[test]
    fn parses_udp() {
        let frame = udp_frame(100);
        let info = parse_header(&frame, 1460).unwrap();
        assert!(info.is_udp());
        assert_eq!(info.l4_header_len, 8);
        assert_eq!(info.payload_len, 100);
        assert!(!info.split_required);
    }

    #[test]
    fn rejects_short_and_foreign() {
        let frame = tcp_frame(0, 0, 0);
        assert_eq!(parse_header(&frame[..53], 0), Err(ParseError::TooSmall));

        let mut arp = frame.clone();
        arp[12..14].copy_from_slice(&[0x08, 0x06]);
        assert_eq!(parse_header(&arp, 0), Err(ParseError::UnknownProtocol));

        let mut v6 = frame.clone();
        v6[14] = 0x65;
        assert_eq!(parse_header(&v6, 0), Err(ParseError::UnknownProtocol));

        let mut bad_ihl = frame.clone();
        bad_ihl[14] = 0x44;
        assert_eq!(parse_header(&bad_ihl, 0), Err(ParseError::UnknownProtocol));

        let mut icmp = frame.clone();
        icmp[23] = 1;
        assert_eq!(parse_header(&icmp, 0), Err(ParseError::UnknownProtocol));

        // options push the TCP header past the first buffer
        let mut long_ip = frame.clone();
        long_ip[14] = 0x4f;
        assert_eq!(parse_header(&long_ip, 0), Err(ParseError::TooSmall));

        let mut short_total = frame;
        short_total[16..18].copy_from_slice(&30u16.to_be_bytes());
        assert_eq!(parse_header(&short_total, 0), Err(ParseError::TooSmall));
    }
}
