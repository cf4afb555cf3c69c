/*! OpenVPN fingerprinting over the first hundred payload packets.

Two independent pass/fail checks, both driven by nothing more than the
opcode byte of each packet. A real OpenVPN session starts with a
handful of distinct control opcodes and then settles into data
packets, while its ACKs cluster in the first seconds of the session.
Flows that merely resemble OpenVPN framing tend to break one of the
two patterns.
*/

use crate::capture::{CaptureError, LinkType, RawFrame};
use crate::fields::OpenvpnFields;
use crate::frame::{self, Transport};
use crate::record::Direction;
use thiserror::Error;
use tracing::*;

/// Number of payload packets both checks run over.
pub const SAMPLE_COUNT: usize = 100;

const OPCODE_SET_MIN: usize = 4;
const OPCODE_SET_MAX: usize = 10;
const WINDOW_COUNT: usize = 10;
const WINDOW_SIZE: usize = SAMPLE_COUNT / WINDOW_COUNT;

/// OpenVPN fields of one payload packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OpenvpnSample {
    pub fields: OpenvpnFields,
    pub transport: Transport,
    pub direction: Direction,
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("The capture must hold at least {SAMPLE_COUNT} payload packets (saw {0})")]
    NotEnoughPackets(usize),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Collect the OpenVPN fields of the first `SAMPLE_COUNT`
/// payload-bearing packets.
pub fn collect_samples<I>(
    frames: I,
    link_type: LinkType,
) -> Result<Vec<OpenvpnSample>, FingerprintError>
where
    I: IntoIterator<Item = Result<RawFrame, CaptureError>>,
{
    let mut samples = Vec::with_capacity(SAMPLE_COUNT);
    let mut first_src = None;
    for raw in frames {
        if samples.len() == SAMPLE_COUNT {
            break;
        }
        let raw = raw?;
        let Some(decoded) = frame::decode(&raw.data, link_type) else {
            continue;
        };
        let src = *first_src.get_or_insert(decoded.src);
        samples.push(OpenvpnSample {
            fields: OpenvpnFields::extract(decoded.payload, decoded.payload_len, decoded.transport),
            transport: decoded.transport,
            direction: if decoded.src == src {
                Direction::SrcToDst
            } else {
                Direction::DstToSrc
            },
        });
    }
    if samples.len() < SAMPLE_COUNT {
        return Err(FingerprintError::NotEnoughPackets(samples.len()));
    }
    Ok(samples)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Check {
    Opcode,
    Ack,
}

impl Check {
    pub fn run(self, samples: &[OpenvpnSample]) -> bool {
        match self {
            Check::Opcode => opcode_check(samples),
            Check::Ack => ack_check(samples),
        }
    }
}

/// Opcode-set uniqueness check.
///
/// The first two opcodes seed the set (an OpenVPN session opens with a
/// HARD_RESET exchange, one distinct opcode per side); the remaining
/// samples may only grow the set within bounds, and may not repeat a
/// seed opcode once the set has reached `OPCODE_SET_MIN`.
pub fn opcode_check(samples: &[OpenvpnSample]) -> bool {
    let seed = [samples[0].fields.opcode, samples[1].fields.opcode];
    if seed[0] == seed[1] {
        debug!("Seed opcodes are both {}", seed[0]);
        return false;
    }
    let mut set = vec![seed[0], seed[1]];
    for sample in &samples[2..] {
        let opcode = sample.fields.opcode;
        if (opcode == seed[0] || opcode == seed[1]) && set.len() >= OPCODE_SET_MIN {
            debug!("Seed opcode {opcode} repeated after the set grew to {}", set.len());
            return false;
        }
        if !set.contains(&opcode) {
            if set.len() > OPCODE_SET_MAX {
                debug!("Opcode set grew past {OPCODE_SET_MAX}");
                return false;
            }
            set.push(opcode);
        }
    }
    debug!("Final opcode set: {set:?}");
    set.len() >= OPCODE_SET_MIN
}

/// ACK temporal-window check.
///
/// The opcode of packet 2 is taken to be the ACK opcode; its
/// occurrences are counted over ten windows of ten packets. ACKs
/// belong to the handshake, so the early windows must hold a few and
/// the late windows almost none.
pub fn ack_check(samples: &[OpenvpnSample]) -> bool {
    let ack_opcode = samples[2].fields.opcode;
    let mut windows = [0u64; WINDOW_COUNT];
    for (i, window) in windows.iter_mut().enumerate() {
        *window = samples[i * WINDOW_SIZE..][..WINDOW_SIZE]
            .iter()
            .filter(|s| s.fields.opcode == ack_opcode)
            .count() as u64;
    }
    debug!("ACK windows: {windows:?}");

    for (i, &count) in windows.iter().enumerate() {
        let ok = match i {
            0 => (1..=3).contains(&count),
            1 => (2..=5).contains(&count),
            2..=4 => count <= 5,
            _ => count <= 1,
        };
        if !ok {
            debug!("Window {i} holds {count} ACKs");
            return false;
        }
    }
    true
}
