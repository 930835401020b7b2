// Frame decoder: Ethernet + IPv4/IPv6 + TCP/UDP/ICMP headers from raw
// capture buffers.
//
// The decoder is zero-copy: a `PacketView` borrows its payload slices from
// the capture buffer and is consumed before the next read reuses it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

// L4 protocol numbers
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

// IPv6 extension header protocol numbers
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTIONS: u8 = 60;

// TCP header
const TCP_MIN_HLEN: usize = 20;
const TCP_FLAGS_OFFSET: usize = 13;
const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

const UDP_HLEN: usize = 8;
const ICMP_MIN_HLEN: usize = 4;

// ---------------------------------------------------------------------------
// Decoded view
// ---------------------------------------------------------------------------

/// TCP header flags relevant to connection lifecycle tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Transport-layer portion of a decoded frame. Payload slices borrow from
/// the capture buffer.
#[derive(Debug)]
pub enum Transport<'a> {
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
        payload: &'a [u8],
    },
    Udp {
        src_port: u16,
        dst_port: u16,
        payload: &'a [u8],
    },
    Icmp {
        icmp_type: u8,
        icmp_code: u8,
    },
}

/// Typed view of a single decoded frame.
#[derive(Debug)]
pub struct PacketView<'a> {
    /// 4 or 6.
    pub ip_version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Total captured frame length, including link-layer header.
    pub captured_len: usize,
    pub transport: Transport<'a>,
}

impl PacketView<'_> {
    pub fn src_port(&self) -> u16 {
        match self.transport {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => src_port,
            Transport::Icmp { .. } => 0,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self.transport {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => dst_port,
            Transport::Icmp { .. } => 0,
        }
    }
}

/// A frame that looked like IP traffic but could not be decoded.
///
/// Distinct from ignored traffic (unknown EtherType, unsupported protocol,
/// trailing fragments), which decodes to `Ok(None)` silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub layer: &'static str,
    pub detail: &'static str,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.layer, self.detail)
    }
}

fn truncated(layer: &'static str) -> DecodeError {
    DecodeError {
        layer,
        detail: "truncated header",
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode an Ethernet frame into a [`PacketView`].
///
/// Returns `Ok(None)` for traffic the recorder does not track (ARP, VLAN,
/// unknown transport protocols, non-first IPv4 fragments) and `Err` for
/// frames that claim to be IP but are malformed.
pub fn decode(frame: &[u8]) -> Result<Option<PacketView<'_>>, DecodeError> {
    if frame.len() < ETH_HLEN {
        return Err(truncated("ethernet"));
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let l3 = &frame[ETH_HLEN..];

    match ethertype {
        ETHERTYPE_IPV4 => decode_ipv4(l3, frame.len()),
        ETHERTYPE_IPV6 => decode_ipv6(l3, frame.len()),
        _ => Ok(None),
    }
}

fn decode_ipv4(data: &[u8], captured_len: usize) -> Result<Option<PacketView<'_>>, DecodeError> {
    if data.len() < IPV4_MIN_HLEN {
        return Err(truncated("ipv4"));
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || data.len() < ihl {
        return Err(DecodeError {
            layer: "ipv4",
            detail: "bad header length",
        });
    }

    // Non-first fragments carry no L4 header.
    let flags_frag = u16::from_be_bytes([
        data[IPV4_FLAGS_FRAG_OFFSET],
        data[IPV4_FLAGS_FRAG_OFFSET + 1],
    ]);
    if (flags_frag & 0x1FFF) != 0 {
        return Ok(None);
    }

    let proto = data[IPV4_PROTO_OFFSET];
    let src_ip = IpAddr::V4(Ipv4Addr::new(
        data[IPV4_SRC_OFFSET],
        data[IPV4_SRC_OFFSET + 1],
        data[IPV4_SRC_OFFSET + 2],
        data[IPV4_SRC_OFFSET + 3],
    ));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(
        data[IPV4_DST_OFFSET],
        data[IPV4_DST_OFFSET + 1],
        data[IPV4_DST_OFFSET + 2],
        data[IPV4_DST_OFFSET + 3],
    ));

    decode_l4(proto, &data[ihl..], 4, src_ip, dst_ip, captured_len)
}

fn decode_ipv6(data: &[u8], captured_len: usize) -> Result<Option<PacketView<'_>>, DecodeError> {
    if data.len() < IPV6_HLEN {
        return Err(truncated("ipv6"));
    }

    let next_hdr = data[IPV6_NEXT_HDR_OFFSET];
    let src_bytes: [u8; 16] = data[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16]
        .try_into()
        .map_err(|_| truncated("ipv6"))?;
    let dst_bytes: [u8; 16] = data[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16]
        .try_into()
        .map_err(|_| truncated("ipv6"))?;

    let src_ip = IpAddr::V6(Ipv6Addr::from(src_bytes));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(dst_bytes));

    let after_fixed = &data[IPV6_HLEN..];
    let (final_proto, ext_offset) = skip_ipv6_extension_headers(next_hdr, after_fixed);

    decode_l4(
        final_proto,
        &after_fixed[ext_offset..],
        6,
        src_ip,
        dst_ip,
        captured_len,
    )
}

/// Skip IPv6 extension headers, returning `(final_next_hdr, offset_into_data)`.
///
/// Recognized: Hop-by-Hop (0), Routing (43), Fragment (44), Destination
/// Options (60). Loops until a non-extension protocol or end of data.
fn skip_ipv6_extension_headers(mut next_hdr: u8, data: &[u8]) -> (u8, usize) {
    let mut offset = 0;
    loop {
        match next_hdr {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTIONS => {
                if offset + 2 > data.len() {
                    return (next_hdr, offset);
                }
                let total_len = (data[offset + 1] as usize + 1) * 8;
                if offset + total_len > data.len() {
                    return (next_hdr, offset);
                }
                next_hdr = data[offset];
                offset += total_len;
            }
            EXT_FRAGMENT => {
                // Fragment header is always 8 bytes
                if offset + 8 > data.len() {
                    return (next_hdr, offset);
                }
                next_hdr = data[offset];
                offset += 8;
            }
            _ => return (next_hdr, offset),
        }
    }
}

fn decode_l4<'a>(
    proto: u8,
    l4: &'a [u8],
    ip_version: u8,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    captured_len: usize,
) -> Result<Option<PacketView<'a>>, DecodeError> {
    let transport = match proto {
        PROTO_TCP => {
            if l4.len() < TCP_MIN_HLEN {
                return Err(truncated("tcp"));
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let data_offset = ((l4[12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HLEN {
                return Err(DecodeError {
                    layer: "tcp",
                    detail: "bad data offset",
                });
            }
            let flag_byte = l4[TCP_FLAGS_OFFSET];
            let flags = TcpFlags {
                syn: flag_byte & TCP_FLAG_SYN != 0,
                ack: flag_byte & TCP_FLAG_ACK != 0,
                fin: flag_byte & TCP_FLAG_FIN != 0,
                rst: flag_byte & TCP_FLAG_RST != 0,
            };
            // Options may extend past the captured slice; clamp instead of
            // rejecting so short captures still yield lifecycle flags.
            let payload = &l4[data_offset.min(l4.len())..];
            Transport::Tcp {
                src_port,
                dst_port,
                flags,
                payload,
            }
        }
        PROTO_UDP => {
            if l4.len() < UDP_HLEN {
                return Err(truncated("udp"));
            }
            Transport::Udp {
                src_port: u16::from_be_bytes([l4[0], l4[1]]),
                dst_port: u16::from_be_bytes([l4[2], l4[3]]),
                payload: &l4[UDP_HLEN..],
            }
        }
        PROTO_ICMP if ip_version == 4 => {
            if l4.len() < ICMP_MIN_HLEN {
                return Err(truncated("icmp"));
            }
            Transport::Icmp {
                icmp_type: l4[0],
                icmp_code: l4[1],
            }
        }
        PROTO_ICMPV6 if ip_version == 6 => {
            if l4.len() < ICMP_MIN_HLEN {
                return Err(truncated("icmpv6"));
            }
            Transport::Icmp {
                icmp_type: l4[0],
                icmp_code: l4[1],
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(PacketView {
        ip_version,
        src_ip,
        dst_ip,
        captured_len,
        transport,
    }))
}

// ---------------------------------------------------------------------------
// Hex dump (DEBUG logging of undecodable frames)
// ---------------------------------------------------------------------------

/// Render a frame as a compact hex string, 16 bytes per space-separated group.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + data.len() / 16 + 1);
    for (i, b) in data.iter().enumerate() {
        if i > 0 && i % 16 == 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------
    // Frame builders
    // -----------------------------------------------------------------

    fn eth_header(ethertype: u16) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ethertype.to_be_bytes());
        f
    }

    fn ipv4_header(proto: u8, src: [u8; 4], dst: [u8; 4], payload_len: usize) -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45; // version 4, IHL 5
        let total = (20 + payload_len) as u16;
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h[8] = 64; // TTL
        h[9] = proto;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        h
    }

    fn tcp_header(src_port: u16, dst_port: u16, flag_byte: u8) -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0..2].copy_from_slice(&src_port.to_be_bytes());
        h[2..4].copy_from_slice(&dst_port.to_be_bytes());
        h[12] = 0x50; // data offset 5
        h[13] = flag_byte;
        h
    }

    fn udp_header(src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
        let mut h = vec![0u8; 8];
        h[0..2].copy_from_slice(&src_port.to_be_bytes());
        h[2..4].copy_from_slice(&dst_port.to_be_bytes());
        h[4..6].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        h
    }

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut f = eth_header(ETHERTYPE_IPV4);
        f.extend(ipv4_header(PROTO_TCP, src, dst, 20));
        f.extend(tcp_header(sport, dport, flags));
        f
    }

    #[test]
    fn tcp_syn_frame_decodes_with_flags() {
        let frame = tcp_frame([10, 0, 0, 1], [8, 8, 8, 8], 40000, 443, TCP_FLAG_SYN);
        let view = decode(&frame).unwrap().unwrap();
        assert_eq!(view.ip_version, 4);
        assert_eq!(view.src_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(view.dst_ip, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        match view.transport {
            Transport::Tcp {
                src_port,
                dst_port,
                flags,
                payload,
            } => {
                assert_eq!(src_port, 40000);
                assert_eq!(dst_port, 443);
                assert!(flags.syn && !flags.ack && !flags.fin && !flags.rst);
                assert!(payload.is_empty());
            }
            other => panic!("expected TCP, got {other:?}"),
        }
    }

    #[test]
    fn tcp_payload_is_borrowed_after_data_offset() {
        let mut frame = tcp_frame(
            [10, 0, 0, 1],
            [8, 8, 8, 8],
            40000,
            443,
            TCP_FLAG_ACK,
        );
        frame.extend_from_slice(&[0x16, 0x03, 0x01]);
        let view = decode(&frame).unwrap().unwrap();
        match view.transport {
            Transport::Tcp { payload, .. } => assert_eq!(payload, &[0x16, 0x03, 0x01]),
            other => panic!("expected TCP, got {other:?}"),
        }
    }

    #[test]
    fn udp_frame_decodes() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(PROTO_UDP, [192, 168, 1, 2], [1, 1, 1, 1], 12));
        frame.extend(udp_header(53001, 53, 4));
        frame.extend_from_slice(&[1, 2, 3, 4]);
        let view = decode(&frame).unwrap().unwrap();
        match view.transport {
            Transport::Udp {
                src_port,
                dst_port,
                payload,
            } => {
                assert_eq!(src_port, 53001);
                assert_eq!(dst_port, 53);
                assert_eq!(payload, &[1, 2, 3, 4]);
            }
            other => panic!("expected UDP, got {other:?}"),
        }
    }

    #[test]
    fn icmpv4_frame_decodes() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(PROTO_ICMP, [10, 0, 0, 1], [10, 0, 0, 2], 8));
        frame.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 0]); // echo request
        let view = decode(&frame).unwrap().unwrap();
        match view.transport {
            Transport::Icmp {
                icmp_type,
                icmp_code,
            } => {
                assert_eq!(icmp_type, 8);
                assert_eq!(icmp_code, 0);
            }
            other => panic!("expected ICMP, got {other:?}"),
        }
    }

    #[test]
    fn ipv6_tcp_frame_decodes() {
        let mut frame = eth_header(ETHERTYPE_IPV6);
        let mut ip6 = vec![0u8; 40];
        ip6[0] = 0x60; // version 6
        ip6[6] = PROTO_TCP;
        ip6[8] = 0xfe;
        ip6[9] = 0x80; // src fe80::
        ip6[24..40].copy_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        frame.extend(ip6);
        frame.extend(tcp_header(55555, 443, TCP_FLAG_SYN));
        let view = decode(&frame).unwrap().unwrap();
        assert_eq!(view.ip_version, 6);
        assert_eq!(view.dst_ip.to_string(), "2001:db8::1");
    }

    #[test]
    fn icmpv6_frame_decodes() {
        let mut frame = eth_header(ETHERTYPE_IPV6);
        let mut ip6 = vec![0u8; 40];
        ip6[0] = 0x60;
        ip6[6] = PROTO_ICMPV6;
        frame.extend(ip6);
        frame.extend_from_slice(&[135, 0, 0, 0]); // neighbor solicitation
        let view = decode(&frame).unwrap().unwrap();
        match view.transport {
            Transport::Icmp { icmp_type, .. } => assert_eq!(icmp_type, 135),
            other => panic!("expected ICMP, got {other:?}"),
        }
    }

    #[test]
    fn unknown_ethertype_is_ignored() {
        let mut frame = eth_header(0x0806); // ARP
        frame.extend_from_slice(&[0u8; 28]);
        assert!(decode(&frame).unwrap().is_none());
    }

    #[test]
    fn unknown_l4_protocol_is_ignored() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(47, [10, 0, 0, 1], [10, 0, 0, 2], 0)); // GRE
        assert!(decode(&frame).unwrap().is_none());
    }

    #[test]
    fn non_first_fragment_is_ignored() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        let mut ip = ipv4_header(PROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 8);
        ip[6..8].copy_from_slice(&0x0010u16.to_be_bytes()); // fragment offset 16
        frame.extend(ip);
        frame.extend(udp_header(1000, 2000, 0));
        assert!(decode(&frame).unwrap().is_none());
    }

    #[test]
    fn truncated_ethernet_is_error() {
        assert!(decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn truncated_ipv4_is_error() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        frame.extend_from_slice(&[0x45, 0, 0]);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn truncated_tcp_is_error() {
        let mut frame = eth_header(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(PROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 4));
        frame.extend_from_slice(&[0, 80, 0, 80]); // 4 bytes of a 20-byte header
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn hex_dump_groups_by_16() {
        let data: Vec<u8> = (0..18).collect();
        let dump = hex_dump(&data);
        assert!(dump.starts_with("000102"));
        assert_eq!(dump.matches(' ').count(), 1);
    }
}
