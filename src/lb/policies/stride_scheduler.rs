//! The stride scheduler used by `weighted_round_robin`'s picker (spec
//! §4.4): an O(1), deterministic, lock-free weighted round-robin sequence
//! generator built from a snapshot of per-endpoint weights.

use std::sync::atomic::{AtomicU64, Ordering};

const MAX_WEIGHT: f64 = u16::MAX as f64;

enum Scheduling {
    /// Fewer than two endpoints carry positive weight; fall back to plain
    /// round robin over all `len` endpoints.
    RoundRobin { len: usize },
    /// Interleaved weighted round robin over `(original_index, scaled_weight)`.
    Stride { entries: Vec<(usize, u16)> },
}

/// Picks among `len` endpoint indices on every call to [`StrideScheduler::next`],
/// in proportion to the weights it was built with.
pub struct StrideScheduler {
    scheduling: Scheduling,
    sequence: AtomicU64,
}

impl StrideScheduler {
    /// `weights[i]` is the current weight of endpoint `i`, or `0.0` if it
    /// should currently never be picked (unless every endpoint is 0).
    pub fn new(weights: &[f32]) -> Self {
        let len = weights.len();
        assert!(len > 0, "stride scheduler requires at least one endpoint");

        let positive: Vec<(usize, f32)> = weights
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, w)| *w > 0.0)
            .collect();

        if positive.len() < 2 {
            return Self {
                scheduling: Scheduling::RoundRobin { len },
                sequence: AtomicU64::new(0),
            };
        }

        let sum: f64 = positive.iter().map(|(_, w)| *w as f64).sum();
        let mean = sum / positive.len() as f64;
        let max_weight = positive
            .iter()
            .map(|(_, w)| *w as f64)
            .fold(f64::MIN, f64::max);
        // Normalize so the maximum scaled weight is `2^16 * mean / max_weight`
        // rather than `2^16` outright, bounding how much one outlier-heavy
        // endpoint can dominate stride spacing.
        let scaling_factor = MAX_WEIGHT * mean / (max_weight * max_weight);

        let entries = positive
            .into_iter()
            .map(|(idx, w)| {
                let scaled = (w as f64 * scaling_factor).round().clamp(1.0, MAX_WEIGHT) as u16;
                (idx, scaled)
            })
            .collect();

        Self {
            scheduling: Scheduling::Stride { entries },
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns the next endpoint index to use, in proportion to weight.
    pub fn next(&self) -> usize {
        match &self.scheduling {
            Scheduling::RoundRobin { len } => {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                (seq % *len as u64) as usize
            }
            Scheduling::Stride { entries } => {
                let n = entries.len() as u64;
                loop {
                    let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let pos = (seq % n) as usize;
                    let (original_index, weight) = entries[pos];
                    let generation = (seq / n) as u16;
                    let current = generation.wrapping_mul(weight);
                    // The stride "wraps" exactly once every `65536/weight`
                    // turns through this slot; that wrap is this slot's
                    // turn to be picked this generation.
                    if current.wrapping_add(weight) <= current {
                        return original_index;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_positive_weight_falls_back_to_round_robin() {
        let sched = StrideScheduler::new(&[5.0, 0.0, 0.0]);
        let picks: Vec<_> = (0..6).map(|_| sched.next()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn all_zero_weights_round_robins_every_endpoint() {
        let sched = StrideScheduler::new(&[0.0, 0.0]);
        let picks: Vec<_> = (0..4).map(|_| sched.next()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn picks_approximate_weight_ratio() {
        // scenario C from the spec: X=200, Y=400 -> ~1:2 ratio.
        let sched = StrideScheduler::new(&[200.0, 400.0]);
        let mut counts = [0usize; 2];
        for _ in 0..6000 {
            counts[sched.next()] += 1;
        }
        let ratio = counts[1] as f64 / counts[0] as f64;
        assert!((ratio - 2.0).abs() < 0.2, "ratio was {ratio}");
    }

    #[test]
    fn zero_weight_endpoints_are_never_picked_when_others_are_positive() {
        let sched = StrideScheduler::new(&[10.0, 0.0, 5.0]);
        for _ in 0..1000 {
            assert_ne!(sched.next(), 1);
        }
    }
}
