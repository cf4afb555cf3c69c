/*! The noise-filter ensemble.

A VPN over TCP splits its records across segments, so the capture is
littered with packets that carry no field structure at all: mostly
back-to-back continuation segments holding a slice of ciphertext with
no header in sight. Three independent heuristics each give a
per-packet opinion; a vote threshold combines them and the surviving
counts elect the direction the classifier will analyse.
*/

use crate::frame::Transport;
use crate::record::{Direction, Flow};
use crate::time::Timeval;
use thiserror::Error;
use tracing::*;

/// Which filters run and how the vote is settled.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FilterConfig {
    pub latency: bool,
    pub length: bool,
    pub zero: bool,
    /// Filter opinions required to admit a packet.
    pub votes_needed: u8,
    /// Percentage of lowest-gap packets the latency filter discards.
    pub latency_percentage: f64,
    /// Zero-bit run length the zero filter looks for.
    pub zero_run_bits: usize,
}

impl Default for FilterConfig {
    fn default() -> FilterConfig {
        FilterConfig {
            latency: true,
            length: true,
            zero: true,
            votes_needed: 2,
            latency_percentage: 40.0,
            zero_run_bits: 16,
        }
    }
}

/// The ensemble left too few admitted packets in either direction
#[derive(Debug, Error)]
#[error("Not enough filtered packets (src->dst: {src}, dst->src: {dst}, needed: {needed})")]
pub struct InsufficientPackets {
    pub src: usize,
    pub dst: usize,
    pub needed: usize,
}

/// Run the enabled filters over the first `nb_records` records, vote,
/// and elect the analysis direction.
///
/// Only TCP flows are voted on: segmentation is what the ensemble
/// exists to launder out. A UDP flow admits every record and keeps the
/// normalizer's majority direction.
pub fn apply(
    flow: &mut Flow,
    config: &FilterConfig,
    nb_records: usize,
    nb_packets_needed: usize,
) -> Result<(), InsufficientPackets> {
    let nb_records = nb_records.min(flow.records.len());
    if flow.transport() == Transport::Udp {
        debug!("UDP flow: segmentation filters skipped");
        let direction = flow.analysis_direction;
        for rec in &mut flow.records[..nb_records] {
            rec.segmented = rec.direction == direction;
        }
        return Ok(());
    }

    if config.latency {
        filter_by_latency(flow, config.latency_percentage, nb_records);
    }
    if config.length {
        filter_by_length(flow, nb_records);
    }
    if config.zero {
        filter_by_zero(flow, config.zero_run_bits, nb_records);
    }

    let mut src_passed = 0;
    let mut dst_passed = 0;
    for rec in &mut flow.records[..nb_records] {
        let mut votes = 0;
        if config.latency && rec.filter_by_latency {
            votes += 1;
        }
        if config.length && rec.filter_by_length {
            votes += 1;
        }
        if config.zero && rec.filter_by_zero {
            votes += 1;
        }
        rec.segmented = votes >= config.votes_needed;
        if rec.segmented {
            match rec.direction {
                Direction::SrcToDst => src_passed += 1,
                Direction::DstToSrc => dst_passed += 1,
            }
        }
    }
    debug!("Vote admitted {src_passed} src->dst, {dst_passed} dst->src");

    if src_passed >= nb_packets_needed {
        flow.analysis_direction = Direction::SrcToDst;
    } else if dst_passed >= nb_packets_needed {
        flow.analysis_direction = Direction::DstToSrc;
    } else {
        return Err(InsufficientPackets {
            src: src_passed,
            dst: dst_passed,
            needed: nb_packets_needed,
        });
    }

    // Admission implies eligibility: records of the losing direction
    // lose their flag.
    let elected = flow.analysis_direction;
    for rec in &mut flow.records[..nb_records] {
        if rec.direction != elected {
            rec.segmented = false;
        }
    }
    Ok(())
}

/// Discard the `percentage` of packets with the smallest inter-arrival
/// gap; tunnels inject continuation segments with gaps near zero.
///
/// Each direction keeps its own previous timestamp, starting at zero:
/// the first gap in a direction is the packet's absolute wall time.
/// The ascending sort ranks gaps relatively, which keeps that first
/// gap at the high end where it is never discarded.
fn filter_by_latency(flow: &mut Flow, percentage: f64, nb_records: usize) {
    debug!("filter_by_latency: {percentage}");
    let mut prev = [Timeval::default(); 2];
    let mut gaps: Vec<(f64, usize)> = Vec::with_capacity(nb_records);
    for (i, rec) in flow.records[..nb_records].iter().enumerate() {
        let slot = match rec.direction {
            Direction::SrcToDst => 0,
            Direction::DstToSrc => 1,
        };
        gaps.push((rec.timestamp.diff(prev[slot]).as_secs_f64(), i));
        prev[slot] = rec.timestamp;
    }

    gaps.sort_by(|a, b| a.0.total_cmp(&b.0));
    let discard = ((percentage * gaps.len() as f64 / 100.0) as usize).min(gaps.len());
    debug!("{} gaps, discarding the lowest {discard}", gaps.len());
    for (rank, &(_, idx)) in gaps.iter().enumerate() {
        flow.records[idx].filter_by_latency = rank >= discard;
    }
}

const LENGTH_DIFF_MAX: u32 = 8;

fn needed_bytes(val: u32) -> usize {
    match val {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn read_be(window: &[u8]) -> u32 {
    window.iter().fold(0, |acc, &b| (acc << 8) | u32::from(b))
}

fn read_le(window: &[u8]) -> u32 {
    window.iter().rev().fold(0, |acc, &b| (acc << 8) | u32::from(b))
}

/// Does a value close to `actual_len` appear somewhere in the payload
/// head, in either byte order, at the minimal width that can hold it?
fn has_length(payload: &[u8], actual_len: u32) -> bool {
    let width = needed_bytes(actual_len);
    if payload.len() < width {
        return false;
    }
    for offset in 0..=payload.len() - width {
        let window = &payload[offset..offset + width];
        if read_be(window).abs_diff(actual_len) <= LENGTH_DIFF_MAX
            || read_le(window).abs_diff(actual_len) <= LENGTH_DIFF_MAX
        {
            return true;
        }
    }
    false
}

fn filter_by_length(flow: &mut Flow, nb_records: usize) {
    debug!("filter_by_length");
    for rec in &mut flow.records[..nb_records] {
        rec.filter_by_length = has_length(&rec.payload, u32::from(rec.payload_len));
    }
}

/// A run of `run_bits` consecutive zero bits anywhere in the payload
/// head. Bits are scanned LSB first within each byte and runs continue
/// across byte boundaries.
fn has_zero_bit_run(data: &[u8], run_bits: usize) -> bool {
    let mut consecutive = 0;
    for &byte in data {
        for bit in 0..8 {
            if (byte >> bit) & 1 == 0 {
                consecutive += 1;
                if consecutive >= run_bits {
                    return true;
                }
            } else {
                consecutive = 0;
            }
        }
    }
    false
}

fn filter_by_zero(flow: &mut Flow, run_bits: usize, nb_records: usize) {
    debug!("filter_by_zero: {run_bits}");
    for rec in &mut flow.records[..nb_records] {
        rec.filter_by_zero = has_zero_bit_run(&rec.payload, run_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Ikev2Fields, OpenvpnFields, WireguardFields};
    use crate::record::PacketRecord;
    use std::net::Ipv4Addr;

    fn record(
        transport: Transport,
        direction: Direction,
        sec: i64,
        payload: Vec<u8>,
        payload_len: u16,
    ) -> PacketRecord {
        PacketRecord {
            timestamp: Timeval::new(sec, 0),
            transport,
            direction,
            payload_len,
            payload,
            packet_count: 0,
            openvpn: OpenvpnFields::default(),
            wireguard: WireguardFields::default(),
            ikev2: Ikev2Fields::default(),
            filter_by_latency: false,
            filter_by_zero: false,
            filter_by_length: false,
            segmented: false,
        }
    }

    fn flow_of(records: Vec<PacketRecord>) -> Flow {
        let src_count = records
            .iter()
            .filter(|r| r.direction == Direction::SrcToDst)
            .count();
        let dst_count = records.len() - src_count;
        Flow {
            records,
            endpoint: (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)),
            src_count,
            dst_count,
            analysis_direction: if src_count > dst_count {
                Direction::SrcToDst
            } else {
                Direction::DstToSrc
            },
        }
    }

    fn tcp_record(sec: i64, payload: Vec<u8>) -> PacketRecord {
        let len = payload.len() as u16;
        record(Transport::Tcp, Direction::SrcToDst, sec, payload, len)
    }

    #[test]
    fn udp_flow_admits_everything() {
        let records = (0..5)
            .map(|i| record(Transport::Udp, Direction::SrcToDst, i, vec![0xFF; 8], 8))
            .collect();
        let mut flow = flow_of(records);
        apply(&mut flow, &FilterConfig::default(), 5, 50).unwrap();
        assert!(flow.records.iter().all(|r| r.segmented));
    }

    #[test]
    fn zero_votes_needed_admits_everything() {
        let records = (0..4).map(|i| tcp_record(i, vec![0xFF; 8])).collect();
        let mut flow = flow_of(records);
        let config = FilterConfig {
            votes_needed: 0,
            ..FilterConfig::default()
        };
        apply(&mut flow, &config, 4, 4).unwrap();
        assert!(flow.records.iter().all(|r| r.segmented));
        assert_eq!(flow.analysis_direction, Direction::SrcToDst);
    }

    #[test]
    fn vote_requires_the_threshold() {
        // Payload holds its own length at offset 0 (length filter hit)
        // and plenty of zero bits (zero filter hit), but the packets
        // arrive in one burst, so most fail the latency filter.
        let records = (0..10).map(|i| {
            let mut payload = vec![0u8; 8];
            payload[0] = 8;
            tcp_record(i, payload)
        });
        let mut flow = flow_of(records.collect());
        let config = FilterConfig {
            votes_needed: 2,
            latency_percentage: 50.0,
            ..FilterConfig::default()
        };
        apply(&mut flow, &config, 10, 5).unwrap();
        // Two of three filters pass everywhere, so the vote admits all.
        assert!(flow.records.iter().all(|r| r.segmented));

        let config = FilterConfig {
            votes_needed: 3,
            latency_percentage: 50.0,
            ..FilterConfig::default()
        };
        let mut flow2 = flow_of(flow.records.clone());
        apply(&mut flow2, &config, 10, 5).unwrap();
        let admitted = flow2.records.iter().filter(|r| r.segmented).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn direction_election_prefers_src_to_dst() {
        let mut records: Vec<_> = (0..6).map(|i| tcp_record(i, vec![0; 4])).collect();
        records.extend((6..12).map(|i| {
            record(Transport::Tcp, Direction::DstToSrc, i, vec![0; 4], 4)
        }));
        let mut flow = flow_of(records);
        let config = FilterConfig {
            votes_needed: 0,
            ..FilterConfig::default()
        };
        apply(&mut flow, &config, 12, 6).unwrap();
        assert_eq!(flow.analysis_direction, Direction::SrcToDst);
    }

    #[test]
    fn unbalanced_flow_elects_the_surviving_direction() {
        // 10 src->dst and 200 dst->src all pass; only dst->src reaches
        // the 50-packet bar.
        let mut records: Vec<_> = (0..10).map(|i| tcp_record(i, vec![0; 4])).collect();
        records.extend((10..210).map(|i| {
            record(Transport::Tcp, Direction::DstToSrc, i, vec![0; 4], 4)
        }));
        let mut flow = flow_of(records);
        let config = FilterConfig {
            votes_needed: 0,
            ..FilterConfig::default()
        };
        apply(&mut flow, &config, 210, 50).unwrap();
        assert_eq!(flow.analysis_direction, Direction::DstToSrc);
    }

    #[test]
    fn too_few_survivors_is_an_error() {
        let records = (0..4).map(|i| tcp_record(i, vec![0xFF; 4])).collect();
        let mut flow = flow_of(records);
        let err = apply(&mut flow, &FilterConfig::default(), 4, 50).unwrap_err();
        assert_eq!(err.needed, 50);
    }

    #[test]
    fn latency_filter_discards_the_smallest_gaps() {
        // Gaps after the first: 1s, 1s, 0s, 10s.
        let seconds = [100, 101, 102, 102, 112];
        let records: Vec<_> = seconds
            .iter()
            .map(|&s| tcp_record(s, vec![0xFF; 4]))
            .collect();
        let mut flow = flow_of(records);
        filter_by_latency(&mut flow, 20.0, 5);
        let kept: Vec<bool> = flow.records.iter().map(|r| r.filter_by_latency).collect();
        // 20% of 5 discards exactly one: the zero gap at index 3.
        assert_eq!(kept, [true, true, true, false, true]);
    }

    #[test]
    fn latency_filter_boundary_percentages() {
        let records: Vec<_> = (0..10).map(|i| tcp_record(i * i, vec![0; 4])).collect();

        let mut all = flow_of(records.clone());
        filter_by_latency(&mut all, 0.0, 10);
        assert!(all.records.iter().all(|r| r.filter_by_latency));

        let mut none = flow_of(records);
        filter_by_latency(&mut none, 100.0, 10);
        assert!(none.records.iter().all(|r| !r.filter_by_latency));
    }

    #[test]
    fn latency_gaps_are_tracked_per_direction() {
        // dst->src packets interleave 1ms behind src->dst ones, but
        // within each direction the gaps are a full second.
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(record(Transport::Tcp, Direction::SrcToDst, 100 + i, vec![0; 4], 4));
            let mut r = record(Transport::Tcp, Direction::DstToSrc, 100 + i, vec![0; 4], 4);
            r.timestamp.usec = 1_000;
            records.push(r);
        }
        let mut flow = flow_of(records);
        filter_by_latency(&mut flow, 25.0, 8);
        let discarded = flow.records.iter().filter(|r| !r.filter_by_latency).count();
        // No interleaving gap falls near zero, so the two discarded
        // entries are just the smallest of the one-second gaps.
        assert_eq!(discarded, 2);
        assert!(flow.records[0].filter_by_latency);
        assert!(flow.records[1].filter_by_latency);
    }

    #[test]
    fn length_filter_spots_an_embedded_length() {
        let mut payload = vec![0xFFu8; 8];
        payload[3] = 201; // close to the observed 200
        let mut flow = flow_of(vec![tcp_record(0, payload)]);
        flow.records[0].payload_len = 200;
        filter_by_length(&mut flow, 1);
        assert!(flow.records[0].filter_by_length);
    }

    #[test]
    fn length_filter_reads_both_byte_orders() {
        // 0x01F4 = 500 big-endian; stored little-endian here.
        let mut payload = vec![0xFFu8; 8];
        payload[2] = 0xF4;
        payload[3] = 0x01;
        let mut flow = flow_of(vec![tcp_record(0, payload)]);
        flow.records[0].payload_len = 500;
        filter_by_length(&mut flow, 1);
        assert!(flow.records[0].filter_by_length);
    }

    #[test]
    fn length_filter_rejects_far_values() {
        let mut flow = flow_of(vec![tcp_record(0, vec![0xEEu8; 8])]);
        flow.records[0].payload_len = 500;
        filter_by_length(&mut flow, 1);
        assert!(!flow.records[0].filter_by_length);
    }

    #[test]
    fn zero_run_counts_bits_not_bytes() {
        // [0x0F, 0xF0] holds 8 consecutive zero bits across the byte
        // boundary in LSB-first order: the high nibble of the first
        // byte, then the low nibble of the second.
        assert!(has_zero_bit_run(&[0x0F, 0xF0], 8));
        assert!(!has_zero_bit_run(&[0x0F, 0xF0], 9));
        assert!(has_zero_bit_run(&[0xFF, 0x00, 0xFF], 8));
        assert!(!has_zero_bit_run(&[0xFF; 16], 1));
        assert!(has_zero_bit_run(&[0b1011_1111], 1));
    }
}
