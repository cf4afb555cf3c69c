/*! Entropy measures over byte sequences.

Two measures feed the high-entropy classifier: normalized Shannon
entropy of the byte distribution, and permutation entropy of the
rank-order patterns in sliding windows. Encrypted bytes score high on
both; counters score high on Shannon but low on permutation.
*/

use thiserror::Error;

/// The input sequence cannot support the requested measure.
#[derive(Debug, Error)]
pub enum EntropyError {
    #[error("Can't take the entropy of an empty sequence")]
    EmptySequence,
    #[error("Order must be at least 2 and the sequence at least as long (len {len}, order {order})")]
    InvalidOrder { len: usize, order: usize },
}

/// Shannon entropy of the byte histogram, normalized to [0, 1] by the
/// 256-symbol maximum of 8 bits.
pub fn shannon_normalized(seq: &[u8]) -> Result<f64, EntropyError> {
    if seq.is_empty() {
        return Err(EntropyError::EmptySequence);
    }
    let mut freq = [0u64; 256];
    for &b in seq {
        freq[usize::from(b)] += 1;
    }
    let n = seq.len() as f64;
    let mut entropy = 0.0;
    for &count in freq.iter() {
        if count > 0 {
            let p = count as f64 / n;
            entropy -= p * p.log2();
        }
    }
    Ok(entropy / 8.0)
}

/// Permutation entropy of order `order`, normalized by ln(order!).
///
/// Each sliding window of `order` values maps to the Lehmer code of
/// its rank permutation; ties are broken stably, by position. The
/// entropy of the pattern distribution is 0 for a monotonic sequence
/// and approaches 1 when all orderings are equally common.
pub fn permutation_entropy(seq: &[u8], order: usize) -> Result<f64, EntropyError> {
    if order < 2 || seq.len() < order {
        return Err(EntropyError::InvalidOrder {
            len: seq.len(),
            order,
        });
    }
    let num_patterns: usize = (2..=order).product();
    let mut pattern_counts = vec![0u64; num_patterns];
    let num_windows = seq.len() - order + 1;

    let mut ranks: Vec<usize> = Vec::with_capacity(order);
    for window in seq.windows(order) {
        ranks.clear();
        ranks.extend(0..order);
        ranks.sort_by_key(|&i| (window[i], i));

        let mut code = 0;
        for j in 0..order {
            let inversions = ranks[j + 1..].iter().filter(|&&k| ranks[j] > k).count();
            code = code * (order - j) + inversions;
        }
        pattern_counts[code] += 1;
    }

    let mut entropy = 0.0;
    for &count in &pattern_counts {
        if count > 0 {
            let p = count as f64 / num_windows as f64;
            entropy -= p * p.ln();
        }
    }
    Ok(entropy / (num_patterns as f64).ln())
}
