/*! Per-byte-column field-type classification.

A payload column is the byte at one fixed offset across many records
of the analysis direction. Plaintext framing leaves fingerprints in
these columns: a protocol version byte never changes while a packet
counter mostly grows, and ciphertext looks uniformly random. Each
column is tried against a fixed list of classifiers; the first match
labels it.
*/

use crate::entropy;
use crate::frame::Transport;
use crate::record::{Direction, Flow, PacketRecord};
use tracing::*;

/// Records at the head of the flow are assumed to be handshake and are
/// never sampled.
pub const INITIAL_PACKETS_SKIPPED: usize = 30;

/// Semantic types a payload column can take.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldType {
    Stable,
    Increment,
    Length,
    HighEntropy,
    Zero,
    Unknown,
}

pub const FIELD_TYPE_COUNT: usize = 6;

impl FieldType {
    /// Single-letter token used in the classification line.
    pub fn token(self) -> &'static str {
        match self {
            FieldType::Stable => "S",
            FieldType::Increment => "I",
            FieldType::Length => "L",
            FieldType::HighEntropy => "R",
            FieldType::Zero => "Z",
            FieldType::Unknown => "U",
        }
    }

    fn index(self) -> usize {
        match self {
            FieldType::Stable => 0,
            FieldType::Increment => 1,
            FieldType::Length => 2,
            FieldType::HighEntropy => 3,
            FieldType::Zero => 4,
            FieldType::Unknown => 5,
        }
    }
}

/// Per-run classifier thresholds, in integer percent.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClassifierConfig {
    pub stable_ratio: u64,
    pub increment_ratio: u64,
    pub length_ratio: u64,
    pub zero_ratio: u64,
}

impl ClassifierConfig {
    /// TCP flows reach the classifier with segment boundaries blurring
    /// field positions, so the stability and length bars sit lower.
    pub const TCP: ClassifierConfig = ClassifierConfig {
        stable_ratio: 40,
        increment_ratio: 70,
        length_ratio: 10,
        zero_ratio: 10,
    };
    pub const UDP: ClassifierConfig = ClassifierConfig {
        stable_ratio: 50,
        increment_ratio: 70,
        length_ratio: 70,
        zero_ratio: 50,
    };

    pub fn for_transport(transport: Transport) -> ClassifierConfig {
        match transport {
            Transport::Tcp => ClassifierConfig::TCP,
            Transport::Udp => ClassifierConfig::UDP,
        }
    }
}

/// The classifier's output: one label per analysed column.
#[derive(Clone, PartialEq, Debug)]
pub struct ClassificationResult {
    pub transport: Transport,
    pub direction: Direction,
    /// `None` means the classifier never visited the column.
    pub field_type: Vec<Option<FieldType>>,
    /// Confidence score per column and type, where a classifier
    /// recorded one.
    pub field_prob: Vec<[f64; FIELD_TYPE_COUNT]>,
}

impl ClassificationResult {
    /// The space-separated token line, one token per column.
    pub fn token_line(&self) -> String {
        self.field_type
            .iter()
            .map(|ty| ty.map_or("N", FieldType::token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn confidence(&self, col: usize, ty: FieldType) -> f64 {
        self.field_prob[col][ty.index()]
    }
}

type ClassifierFn = fn(&[u8], &ClassifierConfig) -> Option<f64>;

/// Tried in declared order; the first match fixes the column type.
const CLASSIFIERS: [(FieldType, ClassifierFn); 4] = [
    (FieldType::Increment, increment_classifier),
    (FieldType::Stable, stable_classifier),
    (FieldType::Zero, zero_classifier),
    (FieldType::HighEntropy, high_entropy_classifier),
];

/// Classify the payload columns of the flow's analysis direction.
///
/// Reads the first `nb_records` records, sampling up to
/// `nb_packets_needed` eligible ones per column.
pub fn classify(
    flow: &Flow,
    nb_records: usize,
    nb_packets_needed: usize,
    nb_byte: usize,
) -> ClassificationResult {
    let nb_records = nb_records.min(flow.records.len());
    let transport = flow.transport();
    let config = ClassifierConfig::for_transport(transport);
    let mut result = ClassificationResult {
        transport,
        direction: flow.analysis_direction,
        field_type: vec![None; nb_byte],
        field_prob: vec![[0.0; FIELD_TYPE_COUNT]; nb_byte],
    };

    for col in 0..nb_byte {
        result.field_type[col] = Some(FieldType::Unknown);
        let samples: Vec<u8> = eligible_records(flow, nb_records)
            .map(|r| r.payload[col])
            .take(nb_packets_needed)
            .collect();
        if samples.is_empty() {
            continue;
        }
        for (ty, classifier) in CLASSIFIERS {
            if let Some(confidence) = classifier(&samples, &config) {
                trace!("column {col}: {ty:?} ({confidence:.1})");
                result.field_type[col] = Some(ty);
                result.field_prob[col][ty.index()] = confidence;
                break;
            }
        }
    }

    // Second pass: adjacent columns re-read as one 16-bit field that
    // may track the payload length. The first matching pair wins and
    // overrides the per-column labels.
    for col in 0..nb_byte.saturating_sub(1) {
        let samples: Vec<(u16, u16)> = eligible_records(flow, nb_records)
            .map(|r| {
                let value = u16::from_be_bytes([r.payload[col], r.payload[col + 1]]);
                (value, r.payload_len)
            })
            .take(nb_packets_needed)
            .collect();
        if samples.is_empty() {
            continue;
        }
        if let Some(confidence) = length_classifier(&samples, &config) {
            debug!("columns {col},{} track the payload length", col + 1);
            result.field_type[col] = Some(FieldType::Length);
            result.field_type[col + 1] = Some(FieldType::Length);
            result.field_prob[col][FieldType::Length.index()] = confidence;
            result.field_prob[col + 1][FieldType::Length.index()] = confidence;
            break;
        }
    }

    result
}

fn eligible_records(flow: &Flow, nb_records: usize) -> impl Iterator<Item = &PacketRecord> {
    let tcp = flow.transport() == Transport::Tcp;
    let direction = flow.analysis_direction;
    flow.records[..nb_records]
        .iter()
        .skip(INITIAL_PACKETS_SKIPPED)
        .filter(move |r| r.direction == direction && (!tcp || r.segmented))
}

fn increment_classifier(samples: &[u8], config: &ClassifierConfig) -> Option<f64> {
    let increments = samples.windows(2).filter(|w| w[1] > w[0]).count() as u64;
    let n = samples.len() as u64;
    (increments * 100 / n > config.increment_ratio)
        .then(|| increments as f64 * 100.0 / n as f64)
}

fn stable_classifier(samples: &[u8], config: &ClassifierConfig) -> Option<f64> {
    let mut counts = [0u64; 256];
    for &b in samples {
        counts[usize::from(b)] += 1;
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    let n = samples.len() as u64;
    (max * 100 / n > config.stable_ratio).then(|| max as f64 * 100.0 / n as f64)
}

/// Disabled: always declines. The type stays in the taxonomy and
/// `zero_ratio` stays in the config so the policy can be restored.
fn zero_classifier(_samples: &[u8], _config: &ClassifierConfig) -> Option<f64> {
    None
}

const PERMUTATION_ORDER: usize = 3;
const PERMUTATION_THRESHOLD: f64 = 0.8;
const SHANNON_THRESHOLD: f64 = 0.5;

fn high_entropy_classifier(samples: &[u8], _config: &ClassifierConfig) -> Option<f64> {
    let permutation = entropy::permutation_entropy(samples, PERMUTATION_ORDER).ok()?;
    if permutation < PERMUTATION_THRESHOLD {
        return None;
    }
    let shannon = entropy::shannon_normalized(samples).ok()?;
    if shannon < SHANNON_THRESHOLD {
        return None;
    }
    Some(shannon)
}

/// Differences between the observed payload length and the 16-bit
/// column value, in either byte order, binned per sample. Differences
/// of 32 or more are ignored.
const LENGTH_DIFF_BINS: usize = 32;

fn length_classifier(samples: &[(u16, u16)], config: &ClassifierConfig) -> Option<f64> {
    let mut bins_be = [0u64; LENGTH_DIFF_BINS];
    let mut bins_le = [0u64; LENGTH_DIFF_BINS];
    for &(value, payload_len) in samples {
        let diff_be = payload_len.wrapping_sub(value);
        let diff_le = payload_len.wrapping_sub(value.swap_bytes());
        if let Some(bin) = bins_be.get_mut(usize::from(diff_be)) {
            *bin += 1;
        }
        if let Some(bin) = bins_le.get_mut(usize::from(diff_le)) {
            *bin += 1;
        }
    }
    let n = samples.len() as u64;
    for bin in bins_be.into_iter().chain(bins_le) {
        if bin * 100 / n >= config.length_ratio {
            return Some(bin as f64 * 100.0 / n as f64);
        }
    }
    None
}
