/*! Normalized per-packet records and the flow that owns them. */

use crate::capture::{CaptureError, LinkType, RawFrame};
use crate::fields::{Ikev2Fields, OpenvpnFields, WireguardFields};
use crate::frame::{self, Transport};
use crate::time::Timeval;
use std::net::Ipv4Addr;
use tracing::*;

/// Direction of a packet relative to the flow's first record: the
/// first record's source address is the `SrcToDst` endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    SrcToDst,
    DstToSrc,
}

/// One payload-bearing packet, normalized for analysis.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PacketRecord {
    pub timestamp: Timeval,
    pub transport: Transport,
    pub direction: Direction,
    /// Observed L4 payload size, from the IP total length.
    pub payload_len: u16,
    /// The first `nb_byte` payload bytes, zero-padded to exactly that
    /// length.
    pub payload: Vec<u8>,
    /// 1-based ordinal over all frames scanned, including skipped ones.
    pub packet_count: u64,
    pub openvpn: OpenvpnFields,
    pub wireguard: WireguardFields,
    pub ikev2: Ikev2Fields,
    pub filter_by_latency: bool,
    pub filter_by_zero: bool,
    pub filter_by_length: bool,
    /// The filter ensemble's vote outcome; only admitted records feed
    /// the classifier.
    pub segmented: bool,
}

/// The record sequence of one endpoint-pair flow.
///
/// Always holds at least one record; the normalizer returns `None`
/// instead of an empty flow.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Flow {
    pub records: Vec<PacketRecord>,
    /// Address pair of the first record, defining `SrcToDst`.
    pub endpoint: (Ipv4Addr, Ipv4Addr),
    pub src_count: usize,
    pub dst_count: usize,
    /// The direction the classifier analyses. The normalizer seeds it
    /// with the majority direction; the filter ensemble's vote
    /// overrides it for TCP flows.
    pub analysis_direction: Direction,
}

impl Flow {
    /// The flow's transport, taken from the first record.
    pub fn transport(&self) -> Transport {
        self.records[0].transport
    }
}

/// Drive the decoder over a capture, building the record sequence.
///
/// Scans until `max_records` payload-bearing packets have been
/// collected or the capture ends. Returns `Ok(None)` when the capture
/// holds no payload-bearing IPv4 packet at all.
pub fn normalize<I>(
    frames: I,
    link_type: LinkType,
    max_records: usize,
    nb_byte: usize,
) -> Result<Option<Flow>, CaptureError>
where
    I: IntoIterator<Item = Result<RawFrame, CaptureError>>,
{
    let mut records: Vec<PacketRecord> = Vec::new();
    let mut endpoint: Option<(Ipv4Addr, Ipv4Addr)> = None;
    let mut src_count = 0;
    let mut dst_count = 0;
    let mut packet_count = 0u64;

    for raw in frames {
        let raw = raw?;
        packet_count += 1;
        if records.len() == max_records {
            break;
        }
        let Some(decoded) = frame::decode(&raw.data, link_type) else {
            continue;
        };
        let (first_src, _) = *endpoint.get_or_insert((decoded.src, decoded.dst));
        let direction = if decoded.src == first_src {
            src_count += 1;
            Direction::SrcToDst
        } else {
            dst_count += 1;
            Direction::DstToSrc
        };

        let mut payload = vec![0; nb_byte];
        let head = decoded.payload.len().min(nb_byte);
        payload[..head].copy_from_slice(&decoded.payload[..head]);

        records.push(PacketRecord {
            timestamp: raw.timestamp,
            transport: decoded.transport,
            direction,
            payload_len: decoded.payload_len,
            payload,
            packet_count,
            openvpn: OpenvpnFields::extract(decoded.payload, decoded.payload_len, decoded.transport),
            wireguard: WireguardFields::extract(decoded.payload, decoded.transport),
            ikev2: Ikev2Fields::extract(decoded.payload, decoded.transport),
            filter_by_latency: false,
            filter_by_zero: false,
            filter_by_length: false,
            segmented: false,
        });
    }

    let Some(endpoint) = endpoint else {
        return Ok(None);
    };
    let analysis_direction = if src_count > dst_count {
        Direction::SrcToDst
    } else {
        Direction::DstToSrc
    };
    debug!(
        "Normalized {} records ({src_count} src->dst, {dst_count} dst->src)",
        records.len()
    );
    Ok(Some(Flow {
        records,
        endpoint,
        src_count,
        dst_count,
        analysis_direction,
    }))
}
