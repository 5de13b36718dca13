//! IP/TCP/UDP frame parsing and synthesis.
//!
//! Parsing produces a typed view over a raw frame using smoltcp wire types,
//! with length and Internet-checksum validation; malformed frames surface as
//! [`Error::InvalidPacket`] so the engine can drop and count them. Synthesis
//! is the only path allowed to produce frames written back to the TUN
//! descriptor.

use crate::error::{Error, Result};
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const DEFAULT_MSS: u16 = 1360;
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// Typed view of one raw frame. Payload is referenced by offset into the
/// original buffer rather than copied.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            Transport::Other(_) => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            Transport::Other(_) => None,
        }
    }
}

/// Parse a raw IP frame.
pub fn parse_frame(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(Error::InvalidPacket("empty frame".to_string()));
    }
    match (data[0] >> 4) & 0x0F {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(Error::InvalidPacket(format!("IP version {}", v))),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| Error::InvalidPacket(format!("IPv4: {}", e)))?;

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || fold_sum(sum_words(&data[..ihl])) != 0xFFFF {
        return Err(Error::InvalidPacket("IPv4 header checksum".to_string()));
    }
    // Fragments would need reassembly; drop them like any unsupported frame.
    let frag = u16::from_be_bytes([data[6], data[7]]);
    if frag & 0x3FFF != 0 {
        return Err(Error::InvalidPacket("IPv4 fragment".to_string()));
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();
    let protocol = pkt.next_header();
    let segment = &data[ihl..total_len];

    let pseudo = pseudo_sum_v4(&src.octets(), &dst.octets(), protocol.into(), segment.len());
    let transport = parse_transport(protocol, segment, ihl, pseudo)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv4,
        src_addr: IpAddr::V4(src),
        dst_addr: IpAddr::V4(dst),
        protocol,
        transport,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| Error::InvalidPacket(format!("IPv6: {}", e)))?;

    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();
    let protocol = pkt.next_header();
    let segment = &data[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len];

    let pseudo = pseudo_sum_v6(&src.octets(), &dst.octets(), protocol.into(), segment.len());
    let transport = parse_transport(protocol, segment, IPV6_HEADER_LEN, pseudo)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv6,
        src_addr: IpAddr::V6(src),
        dst_addr: IpAddr::V6(dst),
        protocol,
        transport,
    })
}

fn parse_transport(
    protocol: IpProtocol,
    segment: &[u8],
    ip_header_len: usize,
    pseudo: u32,
) -> Result<Transport> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(segment, ip_header_len, pseudo),
        IpProtocol::Udp => parse_udp(segment, ip_header_len, pseudo),
        other => Ok(Transport::Other(other.into())),
    }
}

fn parse_tcp(segment: &[u8], ip_header_len: usize, pseudo: u32) -> Result<Transport> {
    let pkt = TcpPacket::new_checked(segment)
        .map_err(|e| Error::InvalidPacket(format!("TCP: {}", e)))?;

    if fold_sum(pseudo.wrapping_add(sum_words(segment))) != 0xFFFF {
        return Err(Error::InvalidPacket("TCP checksum".to_string()));
    }

    let header_len = pkt.header_len() as usize;
    let mut mss = None;

    // Walk the options for MSS; anything else is skipped by length.
    if header_len > TCP_HEADER_LEN && segment.len() >= header_len {
        let opts = &segment[TCP_HEADER_LEN..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 1 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    Ok(Transport::Tcp(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        payload_offset: ip_header_len + header_len,
        payload_len: segment.len().saturating_sub(header_len),
    }))
}

fn parse_udp(segment: &[u8], ip_header_len: usize, pseudo: u32) -> Result<Transport> {
    let pkt = UdpPacket::new_checked(segment)
        .map_err(|e| Error::InvalidPacket(format!("UDP: {}", e)))?;

    // Checksum 0 means "not computed" and is legal on IPv4.
    let cksum = u16::from_be_bytes([segment[6], segment[7]]);
    if cksum != 0 && fold_sum(pseudo.wrapping_add(sum_words(segment))) != 0xFFFF {
        return Err(Error::InvalidPacket("UDP checksum".to_string()));
    }

    Ok(Transport::Udp(UdpDatagram {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload_offset: ip_header_len + UDP_HEADER_LEN,
        payload_len: pkt.payload().len(),
    }))
}

/// Synthesize a TCP frame from session state. The address families of `src`
/// and `dst` must match.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Result<Vec<u8>> {
    let opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_len = TCP_HEADER_LEN + opts_len + payload.len();

    let (mut frame, tcp_start, pseudo) = ip_header(src, dst, IpProtocol::Tcp, tcp_len)?;

    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&ack.to_be_bytes());
    frame.push((((TCP_HEADER_LEN + opts_len) / 4) as u8) << 4);
    frame.push(flags.to_byte());
    frame.extend_from_slice(&window.to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // checksum placeholder
    frame.extend_from_slice(&[0, 0]); // urgent pointer
    if opts_len > 0 {
        let mss = mss.unwrap_or(DEFAULT_MSS);
        frame.extend_from_slice(&[2, 4]);
        frame.extend_from_slice(&mss.to_be_bytes());
    }
    frame.extend_from_slice(payload);

    let cksum = transport_checksum(pseudo, &frame[tcp_start..]);
    frame[tcp_start + 16..tcp_start + 18].copy_from_slice(&cksum.to_be_bytes());
    Ok(frame)
}

/// Synthesize a UDP frame.
pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let (mut frame, udp_start, pseudo) = ip_header(src, dst, IpProtocol::Udp, udp_len)?;

    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // checksum placeholder
    frame.extend_from_slice(payload);

    let mut cksum = transport_checksum(pseudo, &frame[udp_start..]);
    if cksum == 0 {
        cksum = 0xFFFF;
    }
    frame[udp_start + 6..udp_start + 8].copy_from_slice(&cksum.to_be_bytes());
    Ok(frame)
}

/// Write the IP header for one transport segment, returning the frame with
/// header in place, the transport offset, and the pseudo-header sum.
fn ip_header(
    src: SocketAddr,
    dst: SocketAddr,
    protocol: IpProtocol,
    transport_len: usize,
) -> Result<(Vec<u8>, usize, u32)> {
    static IP_ID: AtomicU16 = AtomicU16::new(1);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = IPV4_HEADER_LEN + transport_len;
            let mut frame = Vec::with_capacity(total_len);
            frame.push(0x45);
            frame.push(0x00);
            frame.extend_from_slice(&(total_len as u16).to_be_bytes());
            frame.extend_from_slice(&IP_ID.fetch_add(1, Ordering::Relaxed).to_be_bytes());
            frame.extend_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
            frame.push(64); // TTL
            frame.push(protocol.into());
            frame.extend_from_slice(&[0, 0]); // header checksum placeholder
            frame.extend_from_slice(&s.octets());
            frame.extend_from_slice(&d.octets());

            let cksum = !fold_sum(sum_words(&frame[..IPV4_HEADER_LEN]));
            frame[10..12].copy_from_slice(&cksum.to_be_bytes());

            let pseudo = pseudo_sum_v4(&s.octets(), &d.octets(), protocol.into(), transport_len);
            Ok((frame, IPV4_HEADER_LEN, pseudo))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut frame = Vec::with_capacity(IPV6_HEADER_LEN + transport_len);
            frame.extend_from_slice(&[0x60, 0, 0, 0]);
            frame.extend_from_slice(&(transport_len as u16).to_be_bytes());
            frame.push(protocol.into());
            frame.push(64); // hop limit
            frame.extend_from_slice(&s.octets());
            frame.extend_from_slice(&d.octets());

            let pseudo = pseudo_sum_v6(&s.octets(), &d.octets(), protocol.into(), transport_len);
            Ok((frame, IPV6_HEADER_LEN, pseudo))
        }
        _ => Err(Error::InvalidPacket("mixed address families".to_string())),
    }
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn fold_sum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

fn pseudo_sum_v4(src: &[u8; 4], dst: &[u8; 4], proto: u8, len: usize) -> u32 {
    sum_words(src)
        .wrapping_add(sum_words(dst))
        .wrapping_add(proto as u32)
        .wrapping_add(len as u32)
}

fn pseudo_sum_v6(src: &[u8; 16], dst: &[u8; 16], proto: u8, len: usize) -> u32 {
    sum_words(src)
        .wrapping_add(sum_words(dst))
        .wrapping_add(proto as u32)
        .wrapping_add(len as u32)
}

fn transport_checksum(pseudo: u32, segment: &[u8]) -> u16 {
    !fold_sum(pseudo.wrapping_add(sum_words(segment)))
}
