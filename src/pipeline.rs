/*! The analysis pipeline: preconditions, phases, output.

The capture is read in passes, each opening it afresh: the endpoint
precondition, the payload-packet count, and finally normalization.
From there the phases run strictly forward over the record vector:
filter ensemble, then classifier. The first failing phase aborts the
run.
*/

use crate::capture::{Capture, CaptureError, LinkType};
use crate::classify::{self, ClassificationResult};
use crate::filter::{self, FilterConfig, InsufficientPackets};
use crate::frame;
use crate::record::{self, Flow};
use crate::time::PhaseClock;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::*;

/// Records past this point are ignored by the filter and classifier.
pub const MAX_ANALYZED_RECORDS: usize = 5000;

#[derive(Clone, PartialEq, Debug)]
pub struct PipelineConfig {
    /// Usable packets required per direction, and the per-column
    /// sample size.
    pub nb_packets_needed: usize,
    /// Payload byte columns to classify.
    pub nb_bytes_needed: usize,
    /// Skip the single-endpoint-pair precondition.
    pub skip_pair_check: bool,
    pub filter: FilterConfig,
}

impl Default for PipelineConfig {
    fn default() -> PipelineConfig {
        PipelineConfig {
            nb_packets_needed: 50,
            nb_bytes_needed: 24,
            skip_pair_check: false,
            filter: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Endpoint checking needs an Ethernet capture (link type {0:?})")]
    UnsupportedLink(LinkType),
    #[error("The capture holds more than one endpoint pair")]
    MultipleEndpointPairs,
    #[error("Not enough payload packets (needed: {needed}, actual: {actual})")]
    NotEnoughPackets { needed: usize, actual: usize },
    #[error(transparent)]
    InsufficientPackets(#[from] InsufficientPackets),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Fail unless every frame in the capture belongs to a single IPv4
/// address pair.
pub fn check_endpoint_pair(path: &Path) -> Result<(), PipelineError> {
    let mut capture = Capture::open(path)?;
    if capture.link_type() != LinkType::Ethernet {
        return Err(PipelineError::UnsupportedLink(capture.link_type()));
    }
    let mut pair: Option<(Ipv4Addr, Ipv4Addr)> = None;
    while let Some(raw) = capture.next_frame()? {
        let Some((src, dst)) = frame::ipv4_addresses(&raw.data, LinkType::Ethernet) else {
            continue;
        };
        let (a, b) = *pair.get_or_insert((src, dst));
        if (src != a && src != b) || (dst != a && dst != b) {
            debug!("Third address seen: {src} -> {dst}");
            return Err(PipelineError::MultipleEndpointPairs);
        }
    }
    Ok(())
}

/// Count the packets carrying L4 payload.
pub fn count_payload_packets(path: &Path) -> Result<usize, PipelineError> {
    let mut capture = Capture::open(path)?;
    let link_type = capture.link_type();
    let mut count = 0;
    while let Some(raw) = capture.next_frame()? {
        if frame::decode(&raw.data, link_type).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Run the whole pipeline over a capture file.
pub fn run(path: &Path, config: &PipelineConfig) -> Result<ClassificationResult, PipelineError> {
    run_with_flow(path, config).map(|(result, _)| result)
}

/// Like [`run`], but returning the filtered flow as well, for callers
/// that want to inspect the records behind the labels.
pub fn run_with_flow(
    path: &Path,
    config: &PipelineConfig,
) -> Result<(ClassificationResult, Flow), PipelineError> {
    let mut clock = PhaseClock::start();

    if !config.skip_pair_check {
        check_endpoint_pair(path)?;
    }
    let available = count_payload_packets(path)?;
    debug!("{available} payload packets in {}", path.display());
    if available < config.nb_packets_needed {
        return Err(PipelineError::NotEnoughPackets {
            needed: config.nb_packets_needed,
            actual: available,
        });
    }

    let mut capture = Capture::open(path)?;
    let link_type = capture.link_type();
    let flow = record::normalize(&mut capture, link_type, available, config.nb_bytes_needed)?;
    let mut flow = flow.ok_or(PipelineError::NotEnoughPackets {
        needed: config.nb_packets_needed,
        actual: 0,
    })?;
    debug!("Normalized in {:?}", clock.lap());

    let analyzed = available.min(MAX_ANALYZED_RECORDS);
    filter::apply(&mut flow, &config.filter, analyzed, config.nb_packets_needed)?;
    debug!(
        "Filtered in {:?}; analysis direction {:?}",
        clock.lap(),
        flow.analysis_direction
    );

    let result = classify::classify(
        &flow,
        analyzed,
        config.nb_packets_needed,
        config.nb_bytes_needed,
    );
    debug!("Classified in {:?}", clock.lap());
    Ok((result, flow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FieldType;
    use crate::frame::testutil::build_frame;
    use crate::frame::Transport;
    use crate::record::Direction;
    use std::io::Write;
    use std::path::PathBuf;

    const A: [u8; 4] = [10, 1, 1, 1];
    const B: [u8; 4] = [10, 1, 1, 2];
    const C: [u8; 4] = [10, 1, 1, 3];

    struct TempCapture(PathBuf);

    impl Drop for TempCapture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    /// Write a little-endian Ethernet pcap holding the given frames,
    /// one second apart.
    fn write_capture(name: &str, frames: &[Vec<u8>]) -> TempCapture {
        let path = std::env::temp_dir().join(format!("vpnlens_{name}_{}.pcap", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0xD4, 0xC3, 0xB2, 0xA1]).unwrap();
        for word in [2u32 << 16, 0, 0, 65535, 1] {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        for (i, frame) in frames.iter().enumerate() {
            let len = frame.len() as u32;
            for word in [1_700_000_000 + i as u32, 0, len, len] {
                file.write_all(&word.to_le_bytes()).unwrap();
            }
            file.write_all(frame).unwrap();
        }
        TempCapture(path)
    }

    fn counter_frames(count: u16) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let mut payload = vec![0xAA; 24];
                payload[0] = 0x00;
                payload[1] = 0xC0;
                payload[2] = i as u8;
                build_frame(Transport::Udp, A, B, &payload)
            })
            .collect()
    }

    #[test]
    fn classifies_a_udp_flow_end_to_end() {
        let capture = write_capture("udp_counter", &counter_frames(200));
        let result = run(&capture.0, &PipelineConfig::default()).unwrap();
        assert_eq!(result.transport, Transport::Udp);
        assert_eq!(result.direction, Direction::SrcToDst);
        assert_eq!(result.field_type.len(), 24);
        assert_eq!(result.field_type[0], Some(FieldType::Stable));
        assert_eq!(result.field_type[1], Some(FieldType::Stable));
        assert_eq!(result.field_type[2], Some(FieldType::Increment));
        assert_eq!(result.field_type[3], Some(FieldType::Stable));
    }

    #[test]
    fn token_line_has_one_token_per_column() {
        let capture = write_capture("token_line", &counter_frames(200));
        let config = PipelineConfig {
            nb_bytes_needed: 16,
            ..PipelineConfig::default()
        };
        let result = run(&capture.0, &config).unwrap();
        let line = result.token_line();
        assert_eq!(line.split(' ').count(), 16);
        assert!(line.starts_with("S S I"));
    }

    #[test]
    fn udp_flows_admit_every_record() {
        let capture = write_capture("udp_admit", &counter_frames(200));
        let (_, flow) = run_with_flow(&capture.0, &PipelineConfig::default()).unwrap();
        assert!(flow.records.iter().all(|r| r.segmented));
    }

    #[test]
    fn admitted_records_match_the_analysis_direction() {
        let frames: Vec<Vec<u8>> = (0..300u16)
            .map(|i| {
                // One A->B packet of pure ones for every two B->A
                // packets of zeros: only the zero-heavy direction can
                // gather the two votes the aggregator wants.
                if i % 3 == 0 {
                    build_frame(Transport::Tcp, A, B, &[0xFF; 24])
                } else {
                    build_frame(Transport::Tcp, B, A, &[0x00; 24])
                }
            })
            .collect();
        let capture = write_capture("vote_direction", &frames);
        let config = PipelineConfig {
            filter: FilterConfig {
                latency_percentage: 30.0,
                ..FilterConfig::default()
            },
            ..PipelineConfig::default()
        };
        let (result, flow) = run_with_flow(&capture.0, &config).unwrap();
        assert_eq!(result.direction, flow.analysis_direction);
        for rec in flow.records.iter().filter(|r| r.segmented) {
            assert_eq!(rec.direction, flow.analysis_direction);
        }
        // The majority direction keeps two of every three packets.
        assert_eq!(flow.analysis_direction, Direction::DstToSrc);
    }

    #[test]
    fn rejects_a_third_endpoint() {
        let mut frames = counter_frames(200);
        frames.push(build_frame(Transport::Udp, C, B, &[1; 24]));
        let capture = write_capture("three_endpoints", &frames);
        let err = run(&capture.0, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MultipleEndpointPairs));

        let config = PipelineConfig {
            skip_pair_check: true,
            ..PipelineConfig::default()
        };
        assert!(run(&capture.0, &config).is_ok());
    }

    #[test]
    fn rejects_too_few_payload_packets() {
        let capture = write_capture("too_few", &counter_frames(10));
        let err = run(&capture.0, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotEnoughPackets {
                needed: 50,
                actual: 10
            }
        ));
    }

    #[test]
    fn missing_file_surfaces_the_open_error() {
        let path = std::env::temp_dir().join("vpnlens_does_not_exist.pcap");
        let err = run(&path, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Capture(CaptureError::Io(_))));
    }

    #[test]
    fn classification_is_stable_across_runs() {
        let capture = write_capture("stable_runs", &counter_frames(200));
        let first = run(&capture.0, &PipelineConfig::default()).unwrap();
        let second = run(&capture.0, &PipelineConfig::default()).unwrap();
        assert_eq!(first.field_type, second.field_type);
    }
}
