//! L2/L3/L4 header parsing for the capture stage, built with `nom`/
//! `nom-derive` for *decoding* inbound frames.
//!
//! Datalink offset is fixed at 14 bytes (Ethernet II only) — deliberately
//! not generalized to other link types.

use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom_derive::{Nom, Parse};

pub const ETHERNET_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Destination MAC, source MAC, ethertype. Parsed by hand with `take`/
/// `be_u16` rather than `#[derive(Nom)]`: nom-derive's array support is
/// version-sensitive and the header is tiny enough that hand-parsing reads
/// no worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub ethertype: u16,
}

impl EthernetHeader {
    fn parse(input: &[u8]) -> IResult<&[u8], EthernetHeader> {
        let (input, _dst_mac) = take(6usize)(input)?;
        let (input, _src_mac) = take(6usize)(input)?;
        let (input, ethertype) = be_u16(input)?;
        Ok((input, EthernetHeader { ethertype }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct Ipv4Header {
    version_ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl Ipv4Header {
    pub fn ihl_bytes(&self) -> usize {
        ((self.version_ihl & 0x0f) as usize) * 4
    }

    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct TcpPorts {
    pub src_port: u16,
    pub dst_port: u16,
    _seq: u32,
    _ack: u32,
    _data_offset_reserved: u8,
    pub raw_flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct UdpPorts {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Everything the capture stage needs out of one Ethernet/IPv4 frame to
/// build a [`crate::flow::FlowKey`] and octet/flag deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tos: u8,
    pub raw_tcp_flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    NotIpv4,
}

/// Parses one Ethernet frame down to the fields the flow key needs.
/// Non-IPv4 ethertypes are rejected with [`ParseError::NotIpv4`] rather than
/// silently producing a zeroed key — this probe handles IPv4 only.
pub fn parse_frame(bytes: &[u8]) -> Result<ParsedFrame, ParseError> {
    let (rest, eth) = parse_ethernet(bytes).map_err(|_| ParseError::Truncated)?;
    if eth.ethertype != ETHERTYPE_IPV4 {
        return Err(ParseError::NotIpv4);
    }
    let (after_ip, ip) = parse_ipv4(rest).map_err(|_| ParseError::Truncated)?;
    let ihl = ip.ihl_bytes();
    if ihl < 20 || after_ip.len() + 20 < ihl {
        return Err(ParseError::Truncated);
    }
    let options_len = ihl - 20;
    let transport = after_ip.get(options_len..).ok_or(ParseError::Truncated)?;

    let (src_port, dst_port, raw_tcp_flags) = match ip.protocol {
        PROTO_TCP => {
            let (_, tcp) = parse_tcp(transport).map_err(|_| ParseError::Truncated)?;
            (tcp.src_port, tcp.dst_port, tcp.raw_flags)
        }
        PROTO_UDP => {
            let (_, udp) = parse_udp(transport).map_err(|_| ParseError::Truncated)?;
            (udp.src_port, udp.dst_port, 0)
        }
        _ => (0, 0, 0),
    };

    Ok(ParsedFrame {
        src_addr: ip.src_addr,
        dst_addr: ip.dst_addr,
        src_port,
        dst_port,
        proto: ip.protocol,
        tos: ip.tos,
        raw_tcp_flags,
    })
}

fn parse_ethernet(input: &[u8]) -> IResult<&[u8], EthernetHeader> {
    EthernetHeader::parse(input)
}

fn parse_ipv4(input: &[u8]) -> IResult<&[u8], Ipv4Header> {
    Ipv4Header::parse(input)
}

fn parse_tcp(input: &[u8]) -> IResult<&[u8], TcpPorts> {
    TcpPorts::parse(input)
}

fn parse_udp(input: &[u8]) -> IResult<&[u8], UdpPorts> {
    UdpPorts::parse(input)
}

/// Remaps raw TCP control bits (`CWR ECE URG ACK PSH RST SYN FIN`, as they
/// sit in the wire byte) into [`crate::flow::TcpFlags`] — on this link the
/// two happen to share bit order, so this is the identity map, kept as an
/// explicit function so a future non-identity remap has a single call site.
pub fn remap_tcp_flags(raw: u8) -> crate::flow::TcpFlags {
    crate::flow::TcpFlags::from_bits_truncate(raw)
}
