//! Sampling-pass key counting and applier boundary proposal.
//!
//! During the sampling pass every decoded mutation of the sample files is
//! observed and counted under its key (the start key for range mutations).
//! `propose_boundaries` then cuts the observed key space into contiguous
//! segments of roughly equal operation count. Counts are advisory and only
//! live until the batch partition is installed.

use std::collections::BTreeMap;

use super::error::LoaderError;
use super::types::Mutation;

/// Per-key operation counts collected from sampled mutations.
#[derive(Debug, Default)]
pub struct RangeSampler {
    counts: BTreeMap<Vec<u8>, u64>,
    total: u64,
}

impl RangeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, mutation: &Mutation) {
        *self.counts.entry(mutation.key.clone()).or_default() += 1;
        self.total += 1;
    }

    /// Total number of observed mutations.
    pub fn sampled_mutations(&self) -> u64 {
        self.total
    }

    pub fn distinct_keys(&self) -> usize {
        self.counts.len()
    }

    pub fn key_counts(&self) -> Vec<(Vec<u8>, u64)> {
        self.counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.total = 0;
    }

    /// Propose exactly `applier_count` strictly increasing range boundaries.
    ///
    /// The first boundary is the empty key so the ranges cover the whole key
    /// space. Boundary `i` is placed at the observed key whose prefix count
    /// (operations strictly below the key) is closest to `i * total / n`.
    /// On a tie, the candidate whose own segment is closer to `total / n`
    /// wins, then the lower key. Each boundary leaves enough candidates for
    /// the remaining ones. When fewer distinct keys than appliers were
    /// observed, the tail is padded with successor keys of the last boundary;
    /// those ranges are empty.
    pub fn propose_boundaries(&self, applier_count: usize) -> Result<Vec<Vec<u8>>, LoaderError> {
        if applier_count == 0 {
            return Err(LoaderError::InvalidPartition {
                reason: "applier count must be at least 1".to_string(),
            });
        }

        // Candidate cut points with the operation count strictly below them.
        // The empty key can never be a cut point; it is always boundary 0.
        let mut candidates: Vec<(&[u8], u64)> = Vec::with_capacity(self.counts.len());
        let mut prefix = 0u64;
        for (key, count) in &self.counts {
            if !key.is_empty() {
                candidates.push((key.as_slice(), prefix));
            }
            prefix += count;
        }

        let n = applier_count as u128;
        let total = u128::from(self.total);
        let cuts_needed = applier_count - 1;
        let mut boundaries: Vec<Vec<u8>> = Vec::with_capacity(applier_count);
        boundaries.push(Vec::new());

        let usable = cuts_needed.min(candidates.len());
        let mut next_candidate = 0usize;
        let mut prev_prefix = 0u128;
        for cut in 1..=usable {
            // Leave one candidate for every later cut.
            let last_allowed = candidates.len() - (usable - cut) - 1;
            let ideal = cut as u128 * total;
            let mut best = next_candidate;
            let mut best_cost = (u128::MAX, u128::MAX);
            for (idx, (_, below)) in candidates
                .iter()
                .enumerate()
                .take(last_allowed + 1)
                .skip(next_candidate)
            {
                let below = u128::from(*below);
                let distance = (below * n).abs_diff(ideal);
                let segment = (below - prev_prefix) * n;
                let cost = (distance, segment.abs_diff(total));
                if cost < best_cost {
                    best_cost = cost;
                    best = idx;
                }
            }
            let (key, below) = candidates[best];
            boundaries.push(key.to_vec());
            prev_prefix = u128::from(below);
            next_candidate = best + 1;
        }

        while boundaries.len() < applier_count {
            let mut successor = boundaries.last().cloned().unwrap_or_default();
            successor.push(0);
            boundaries.push(successor);
        }
        Ok(boundaries)
    }
}
