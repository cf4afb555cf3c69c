/*! Decoding link-layer frames down to the transport payload.

Only the minimum needed by the analysis is parsed: IPv4 addresses, the
transport protocol, and where the payload starts. Every read is
bounds-checked against the captured bytes, so truncated or garbage
frames decode to `None` instead of being misread.
*/

use crate::capture::LinkType;
use std::net::Ipv4Addr;
use tracing::*;

pub const ETHERNET_HEADER_LEN: usize = 14;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transport {
    Tcp,
    Udp,
}

/// One frame decoded down to its transport payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DecodedFrame<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub transport: Transport,
    /// The L4 payload as captured. May be shorter than `payload_len`
    /// when the capture was cut by the snap length.
    pub payload: &'a [u8],
    /// L4 payload size according to the IP total length, which is
    /// authoritative even for snapped captures.
    pub payload_len: u16,
}

/// Decode a raw frame, or `None` if it isn't an IPv4 TCP/UDP packet
/// carrying payload.
pub fn decode(data: &[u8], link_type: LinkType) -> Option<DecodedFrame<'_>> {
    let ip = match link_type {
        LinkType::Ethernet => data.get(ETHERNET_HEADER_LEN..)?,
        _ => data,
    };

    let vhl = *ip.first()?;
    let ip_hdr_len = usize::from(vhl & 0x0F) * 4;
    let total_len = usize::from(u16::from_be_bytes([*ip.get(2)?, *ip.get(3)?]));
    if ip_hdr_len < 20 || (total_len != 0 && ip_hdr_len > total_len) {
        debug!("Invalid IP header length {ip_hdr_len}");
        return None;
    }
    if ip.len() < ip_hdr_len {
        return None;
    }
    let protocol = ip[9];
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let l4 = &ip[ip_hdr_len..];
    let (transport, l4_hdr_len) = match protocol {
        IPPROTO_TCP => {
            let offx2 = *l4.get(12)?;
            (Transport::Tcp, usize::from(offx2 >> 4) * 4)
        }
        IPPROTO_UDP => (Transport::Udp, 8),
        _ => return None,
    };

    let payload_len = total_len.checked_sub(ip_hdr_len + l4_hdr_len)?;
    if payload_len == 0 {
        return None;
    }
    let payload = l4.get(l4_hdr_len..).unwrap_or(&[]);
    Some(DecodedFrame {
        src,
        dst,
        transport,
        payload,
        payload_len: payload_len as u16,
    })
}

/// The IPv4 address pair of a frame, without caring what it carries.
///
/// Used by the endpoint-pair precondition, which inspects every frame
/// of the capture, payload or not.
pub fn ipv4_addresses(data: &[u8], link_type: LinkType) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let ip = match link_type {
        LinkType::Ethernet => data.get(ETHERNET_HEADER_LEN..)?,
        _ => data,
    };
    if ip.len() < 20 {
        return None;
    }
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    Some((src, dst))
}


#[cfg(test)]
mod tests {
    use super::testutil::build_frame;
    use super::*;

    const SRC: [u8; 4] = [10, 0, 0, 1];
    const DST: [u8; 4] = [10, 0, 0, 2];

    #[test]
    fn decodes_udp_payload() {
        let frame = build_frame(Transport::Udp, SRC, DST, b"datagram");
        let decoded = decode(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(decoded.transport, Transport::Udp);
        assert_eq!(decoded.src, Ipv4Addr::from(SRC));
        assert_eq!(decoded.dst, Ipv4Addr::from(DST));
        assert_eq!(decoded.payload, b"datagram");
        assert_eq!(decoded.payload_len, 8);
    }

    #[test]
    fn decodes_tcp_payload() {
        let frame = build_frame(Transport::Tcp, SRC, DST, b"\x00\x2a\x20rest");
        let decoded = decode(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(decoded.transport, Transport::Tcp);
        assert_eq!(decoded.payload_len, 7);
        assert_eq!(decoded.payload[2], 0x20);
    }

    #[test]
    fn raw_link_frames_start_at_the_ip_header() {
        let frame = build_frame(Transport::Udp, SRC, DST, b"xyz");
        let decoded = decode(&frame[ETHERNET_HEADER_LEN..], LinkType::Raw).unwrap();
        assert_eq!(decoded.payload, b"xyz");
    }

    #[test]
    fn skips_empty_payloads() {
        let frame = build_frame(Transport::Udp, SRC, DST, b"");
        assert!(decode(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn skips_non_transport_protocols() {
        let mut frame = build_frame(Transport::Udp, SRC, DST, b"abc");
        frame[ETHERNET_HEADER_LEN + 9] = 1; // ICMP
        assert!(decode(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn rejects_bad_ihl() {
        let mut frame = build_frame(Transport::Udp, SRC, DST, b"abc");
        frame[ETHERNET_HEADER_LEN] = 0x44; // IHL of 4 words
        assert!(decode(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn rejects_frames_cut_inside_the_headers() {
        let frame = build_frame(Transport::Tcp, SRC, DST, b"payload");
        for cut in 0..ETHERNET_HEADER_LEN + 20 + 13 {
            assert!(
                decode(&frame[..cut], LinkType::Ethernet).is_none(),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn snapped_payload_keeps_the_ip_length() {
        let frame = build_frame(Transport::Udp, SRC, DST, &[0x55; 100]);
        let snapped = &frame[..frame.len() - 80];
        let decoded = decode(snapped, LinkType::Ethernet).unwrap();
        assert_eq!(decoded.payload_len, 100);
        assert_eq!(decoded.payload.len(), 20);
    }

    #[test]
    fn address_pair_of_any_frame() {
        let frame = build_frame(Transport::Udp, SRC, DST, b"");
        let (src, dst) = ipv4_addresses(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(src, Ipv4Addr::from(SRC));
        assert_eq!(dst, Ipv4Addr::from(DST));
        assert!(ipv4_addresses(&frame[..20], LinkType::Ethernet).is_none());
    }
}
