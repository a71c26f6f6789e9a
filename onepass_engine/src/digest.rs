//! Per-cell distribution sketches
//!
//! A [`DigestStore`] keeps one t-digest per grid cell in a flat array and
//! answers quantile and histogram queries for every cell at once. Samples are
//! pushed one scalar at a time, in time order, so that a store fed the same
//! samples in any batch partition ends up identical. NaN samples are skipped.
//! A cell that has seen no samples reports NaN.

use serde::{Deserialize, Serialize};
use tdigest::TDigest;

use crate::frame::Frame;

/// Centroids per unit of compression
const CENTROIDS_PER_COMPRESSION: f64 = 100.0;
/// Bisection steps when inverting the quantile function
const CDF_ITERATIONS: usize = 64;
/// Bytes per serialized centroid (mean and weight)
const CENTROID_BYTES: u64 = 16;

/// Grid of t-digests, one per cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestStore {
    max_size: usize,
    digests: Vec<TDigest>,
}

impl DigestStore {
    /// Create `cells` empty digests with the given compression
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(cells: usize, compression: f64) -> Self {
        let max_size = ((compression * CENTROIDS_PER_COMPRESSION).ceil() as usize).max(1);
        Self {
            max_size,
            digests: vec![TDigest::new_with_size(max_size); cells],
        }
    }

    /// Number of cells
    #[must_use]
    pub fn cells(&self) -> usize {
        self.digests.len()
    }

    /// Number of samples folded into `cell`
    #[must_use]
    pub fn count(&self, cell: usize) -> f64 {
        self.digests[cell].count()
    }

    /// Push every time slice of `batch`, in order, into the per-cell digests
    pub fn update(&mut self, batch: &Frame<f64>) {
        for row in batch.rows() {
            for (digest, value) in self.digests.iter_mut().zip(row) {
                if value.is_nan() {
                    continue;
                }
                *digest = digest.merge_unsorted(vec![*value]);
            }
        }
    }

    /// Estimate each quantile for every cell, laid out `[quantiles, cells]`
    #[must_use]
    pub fn quantiles(&self, quantiles: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(quantiles.len() * self.cells());
        for q in quantiles {
            for digest in &self.digests {
                if digest.is_empty() {
                    out.push(f64::NAN);
                } else {
                    out.push(digest.estimate_quantile(*q));
                }
            }
        }
        out
    }

    /// Histogram of every cell, returned as counts laid out `[bins, cells]`
    /// and edges laid out `[bins + 1, cells]`.
    ///
    /// Without a `range` each cell's histogram spans that cell's minimum and
    /// maximum. Counts are derived from the digest's CDF, so they are
    /// fractional estimates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn histogram(&self, bins: usize, range: Option<(f64, f64)>) -> (Vec<f64>, Vec<f64>) {
        let cells = self.cells();
        let mut counts = vec![0.0; bins * cells];
        let mut edges = vec![f64::NAN; (bins + 1) * cells];

        for (cell, digest) in self.digests.iter().enumerate() {
            if digest.is_empty() {
                for bin in 0..bins {
                    counts[bin * cells + cell] = f64::NAN;
                }
                continue;
            }
            let (low, high) = range.unwrap_or((digest.min(), digest.max()));
            let width = (high - low) / bins as f64;
            for edge in 0..bins {
                edges[edge * cells + cell] = low + width * edge as f64;
            }
            edges[bins * cells + cell] = high;

            let total = digest.count();
            let mut lower = cdf_below(digest, low);
            for bin in 0..bins {
                let edge = edges[(bin + 1) * cells + cell];
                let upper = if bin + 1 == bins {
                    cdf_through(digest, edge)
                } else {
                    cdf_below(digest, edge)
                };
                counts[bin * cells + cell] = (upper - lower).max(0.0) * total;
                lower = upper;
            }
        }
        (counts, edges)
    }

    /// Rough serialized size, used to choose a checkpoint format
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn estimated_bytes(&self) -> u64 {
        let bound = self.max_size as u64;
        self.digests
            .iter()
            .map(|d| (d.count() as u64).min(bound) * CENTROID_BYTES + 8)
            .sum()
    }
}

/// Fraction of mass strictly below `x`
fn cdf_below(digest: &TDigest, x: f64) -> f64 {
    if x <= digest.min() {
        0.0
    } else if x > digest.max() {
        1.0
    } else {
        invert(digest, x)
    }
}

/// Fraction of mass at or below `x`
fn cdf_through(digest: &TDigest, x: f64) -> f64 {
    if x >= digest.max() {
        1.0
    } else if x < digest.min() {
        0.0
    } else {
        invert(digest, x)
    }
}

fn invert(digest: &TDigest, x: f64) -> f64 {
    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    for _ in 0..CDF_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        if digest.estimate_quantile(mid) < x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}
