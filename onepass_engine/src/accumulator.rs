//! One-pass merge algorithms, one per statistic kind
//!
//! An [`Accumulator`] folds sub-batches of samples into a grid-shaped running
//! state. Each call to [`Accumulator::merge`] receives the sub-batch and the
//! number of samples already folded; the sub-batch length is its weight. A
//! sub-batch of many samples is first reduced on its own (two-pass mean, sum
//! of squared deviations, arg-extreme) and then merged, so the result does not
//! depend on how a sequence was split into batches beyond floating-point
//! rounding.
//!
//! # Merge rules
//!
//! With `n` samples already folded, a sub-batch of `w` samples and
//! `n' = n + w`:
//!
//! * Mean: `mean += w·(batch_mean − mean)/n'`.
//! * Variance: `M2 += batch_M2 + (mean − batch_mean)²·n·w/n'`, then the mean
//!   as above. `M2` is never scaled; the variance `M2/(n − 1)` is only formed
//!   on read-out.
//! * Min/Max: a cell's extreme and its timestamp are replaced only by a
//!   strictly better value. NaN is never better, but anything is better than
//!   NaN.
//! * Threshold count: per threshold, count samples at or above it.
//! * Sum: running sum of per-sub-batch sums.
//!
//! Read-out never mutates the accumulator, so continuous accumulation can
//! read out and keep merging.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    digest::DigestStore,
    frame::Frame,
    output::Readout,
    request::{Aggregation, Statistic},
};

pub mod duration;

pub use duration::DurationMax;

/// Which extreme an [`Accumulator::Extreme`] keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extreme {
    /// Smallest value
    Min,
    /// Largest value
    Max,
}

impl Extreme {
    fn better(self, candidate: f64, current: f64) -> bool {
        if candidate.is_nan() {
            return false;
        }
        if current.is_nan() {
            return true;
        }
        match self {
            Extreme::Min => candidate < current,
            Extreme::Max => candidate > current,
        }
    }
}

/// Running state of one statistic over a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    /// Running mean
    Mean {
        /// Per-cell mean
        mean: Vec<f64>,
    },
    /// Running mean and unscaled sum of squared deviations
    Variance {
        /// Per-cell mean
        mean: Vec<f64>,
        /// Per-cell sum of squared deviations from the mean
        m2: Vec<f64>,
    },
    /// Running extreme with the time it occurred
    Extreme {
        /// Minimum or maximum
        kind: Extreme,
        /// Per-cell extreme
        value: Vec<f64>,
        /// Per-cell timestamp of the extreme
        at: Vec<NaiveDateTime>,
    },
    /// Per-threshold exceedance counts
    ThresholdCount {
        /// Thresholds
        thresholds: Vec<f64>,
        /// `[thresholds, cells]` counts
        counts: Vec<f64>,
    },
    /// Running sum
    Sum {
        /// Per-cell sum
        sum: Vec<f64>,
    },
    /// Annual maxima of sliding sums
    DurationMax(DurationMax),
    /// Per-cell distribution sketches
    Distribution(DigestStore),
}

impl Accumulator {
    /// Fresh accumulator for `statistic` over `cells` grid cells
    #[must_use]
    pub fn new(statistic: &Statistic, cells: usize, time_step: u64, compression: f64) -> Self {
        match statistic {
            Statistic::Mean
            | Statistic::Raw
            | Statistic::BiasCorrection {
                aggregation: Aggregation::Mean,
            } => Accumulator::Mean {
                mean: vec![0.0; cells],
            },
            Statistic::Std | Statistic::Var => Accumulator::Variance {
                mean: vec![0.0; cells],
                m2: vec![0.0; cells],
            },
            Statistic::Min | Statistic::Max => Accumulator::Extreme {
                kind: if *statistic == Statistic::Min {
                    Extreme::Min
                } else {
                    Extreme::Max
                },
                value: vec![f64::NAN; cells],
                at: vec![NaiveDateTime::default(); cells],
            },
            Statistic::ThreshExceed { thresholds } => Accumulator::ThresholdCount {
                thresholds: thresholds.clone(),
                counts: vec![0.0; thresholds.len() * cells],
            },
            Statistic::Sum
            | Statistic::BiasCorrection {
                aggregation: Aggregation::Sum,
            } => Accumulator::Sum {
                sum: vec![0.0; cells],
            },
            Statistic::Iams { durations } => {
                Accumulator::DurationMax(DurationMax::new(durations, time_step, cells))
            }
            Statistic::Percentile { .. } | Statistic::Histogram { .. } => {
                Accumulator::Distribution(DigestStore::new(cells, compression))
            }
        }
    }

    /// Fold `batch` into the running state. `count_before` is the number of
    /// samples already folded.
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&mut self, batch: &Frame<f64>, count_before: u64) {
        if batch.is_empty() {
            return;
        }
        let weight = batch.len() as f64;
        let before = count_before as f64;
        let after = before + weight;

        match self {
            Accumulator::Mean { mean } => {
                let batch_mean = column_mean(batch);
                if count_before == 0 {
                    *mean = batch_mean;
                } else {
                    for (m, bm) in mean.iter_mut().zip(batch_mean) {
                        *m += weight * (bm - *m) / after;
                    }
                }
            }
            Accumulator::Variance { mean, m2 } => {
                let batch_mean = column_mean(batch);
                let mut batch_m2 = vec![0.0; batch_mean.len()];
                for row in batch.rows() {
                    for ((acc, x), bm) in batch_m2.iter_mut().zip(row).zip(&batch_mean) {
                        *acc += (x - bm) * (x - bm);
                    }
                }
                if count_before == 0 {
                    *mean = batch_mean;
                    *m2 = batch_m2;
                } else {
                    for (((m, s), bm), bs) in
                        mean.iter_mut().zip(m2.iter_mut()).zip(batch_mean).zip(batch_m2)
                    {
                        let delta = *m - bm;
                        *s += bs + delta * delta * before * weight / after;
                        *m += weight * (bm - *m) / after;
                    }
                }
            }
            Accumulator::Extreme { kind, value, at } => {
                let kind = *kind;
                let (best, best_at) = arg_extreme(kind, batch);
                for (((v, t), b), bt) in value.iter_mut().zip(at.iter_mut()).zip(best).zip(best_at)
                {
                    if count_before == 0 || kind.better(b, *v) {
                        *v = b;
                        *t = bt;
                    }
                }
            }
            Accumulator::ThresholdCount { thresholds, counts } => {
                let cells = batch.cells();
                for row in batch.rows() {
                    for (index, threshold) in thresholds.iter().enumerate() {
                        let counts = &mut counts[index * cells..(index + 1) * cells];
                        for (count, x) in counts.iter_mut().zip(row) {
                            if *x >= *threshold {
                                *count += 1.0;
                            }
                        }
                    }
                }
            }
            Accumulator::Sum { sum } => {
                let mut batch_sum = vec![0.0; sum.len()];
                for row in batch.rows() {
                    for (acc, x) in batch_sum.iter_mut().zip(row) {
                        *acc += x;
                    }
                }
                for (s, bs) in sum.iter_mut().zip(batch_sum) {
                    *s += bs;
                }
            }
            Accumulator::DurationMax(acc) => acc.update(batch),
            Accumulator::Distribution(store) => store.update(batch),
        }
    }

    /// Read out the statistic after `count` samples as one time slice
    /// labelled `label`. The accumulator is left untouched.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn finalise(
        &self,
        statistic: &Statistic,
        count: u64,
        label: NaiveDateTime,
        dims: &[usize],
    ) -> Readout {
        let frame = |leading: Option<usize>, data: Vec<f64>| Frame {
            times: vec![label],
            dims: leading
                .into_iter()
                .chain(dims.iter().copied())
                .collect(),
            data,
        };

        match self {
            Accumulator::Mean { mean } => plain(frame(None, mean.clone())),
            Accumulator::Sum { sum } => plain(frame(None, sum.clone())),
            Accumulator::Variance { m2, .. } => {
                let denominator = count as f64 - 1.0;
                let var = m2.iter().map(|s| {
                    if count > 1 {
                        s / denominator
                    } else {
                        f64::NAN
                    }
                });
                let data = if *statistic == Statistic::Std {
                    var.map(f64::sqrt).collect()
                } else {
                    var.collect()
                };
                plain(frame(None, data))
            }
            Accumulator::Extreme { value, at, .. } => Readout {
                data: frame(None, value.clone()),
                timings: Some(Frame {
                    times: vec![label],
                    dims: dims.to_vec(),
                    data: at.clone(),
                }),
                bin_edges: None,
            },
            Accumulator::ThresholdCount { thresholds, counts } => {
                plain(frame(Some(thresholds.len()), counts.clone()))
            }
            Accumulator::DurationMax(acc) => {
                plain(frame(Some(acc.durations()), acc.maxima().to_vec()))
            }
            Accumulator::Distribution(store) => match statistic {
                Statistic::Histogram { bins, range } => {
                    let (counts, edges) = store.histogram(*bins, *range);
                    Readout {
                        data: frame(Some(*bins), counts),
                        timings: None,
                        bin_edges: Some(frame(Some(bins + 1), edges)),
                    }
                }
                Statistic::Percentile { quantiles } => {
                    plain(frame(Some(quantiles.len()), store.quantiles(quantiles)))
                }
                _ => plain(frame(None, store.quantiles(&[0.5]))),
            },
        }
    }

    /// Rough serialized size of the heavy payload
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        let floats = |v: &Vec<f64>| (v.len() * 8) as u64;
        match self {
            Accumulator::Mean { mean } => floats(mean),
            Accumulator::Sum { sum } => floats(sum),
            Accumulator::Variance { mean, m2 } => floats(mean) + floats(m2),
            Accumulator::Extreme { value, at, .. } => floats(value) + (at.len() * 12) as u64,
            Accumulator::ThresholdCount { counts, .. } => floats(counts),
            Accumulator::DurationMax(acc) => acc.estimated_bytes(),
            Accumulator::Distribution(store) => store.estimated_bytes(),
        }
    }
}

fn plain(data: Frame<f64>) -> Readout {
    Readout {
        data,
        timings: None,
        bin_edges: None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn column_mean(batch: &Frame<f64>) -> Vec<f64> {
    let mut sum = vec![0.0; batch.cells()];
    for row in batch.rows() {
        for (acc, x) in sum.iter_mut().zip(row) {
            *acc += x;
        }
    }
    let weight = batch.len() as f64;
    sum.iter_mut().for_each(|s| *s /= weight);
    sum
}

/// Per-cell extreme of `batch` and the timestamp of its first occurrence
fn arg_extreme(kind: Extreme, batch: &Frame<f64>) -> (Vec<f64>, Vec<NaiveDateTime>) {
    let mut best = batch.row(0).to_vec();
    let mut best_at = vec![batch.times[0]; best.len()];
    for (row, time) in batch.rows().zip(&batch.times).skip(1) {
        for ((b, t), x) in best.iter_mut().zip(best_at.iter_mut()).zip(row) {
            if kind.better(*x, *b) {
                *b = *x;
                *t = *time;
            }
        }
    }
    (best, best_at)
}
