//! Annual maxima of sliding-window sums
//!
//! For each configured duration the accumulator tracks the largest sum of
//! consecutive samples spanning that duration. Only the samples needed for
//! the longest duration are kept, in a circular buffer. Every pushed sample
//! closes one window per duration, provided enough samples have arrived to
//! fill it, and that window's sum is folded into the running maximum.

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Sliding-sum maxima over a set of durations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMax {
    /// Samples per duration, parallel to the configured durations
    spans: Vec<usize>,
    cells: usize,
    /// `capacity × cells` ring of the most recent samples
    buffer: Vec<f64>,
    capacity: usize,
    /// Slot the next sample is written to
    cursor: usize,
    /// Samples held, saturating at `capacity`
    filled: usize,
    /// `spans × cells` running maxima
    maxima: Vec<f64>,
}

impl DurationMax {
    /// Create an accumulator for `durations` minutes sampled every
    /// `time_step` minutes. Durations must be non-zero multiples of
    /// `time_step`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(durations: &[u64], time_step: u64, cells: usize) -> Self {
        let spans: Vec<usize> = durations
            .iter()
            .map(|d| (d / time_step).max(1) as usize)
            .collect();
        let capacity = spans.iter().copied().max().unwrap_or(1);
        Self {
            cells,
            buffer: vec![0.0; capacity * cells],
            capacity,
            cursor: 0,
            filled: 0,
            maxima: vec![f64::NEG_INFINITY; spans.len() * cells],
            spans,
        }
    }

    /// Push every time slice of `batch` in order
    pub fn update(&mut self, batch: &Frame<f64>) {
        for row in batch.rows() {
            self.push(row);
        }
    }

    fn push(&mut self, row: &[f64]) {
        let slot = self.cursor * self.cells;
        self.buffer[slot..slot + self.cells].copy_from_slice(row);
        self.cursor = (self.cursor + 1) % self.capacity;
        self.filled = (self.filled + 1).min(self.capacity);

        for (index, span) in self.spans.iter().enumerate() {
            if *span > self.filled {
                continue;
            }
            // The window ends at the slot just written and wraps past zero
            // when it reaches back further than the cursor.
            let first = (self.cursor + self.capacity - span) % self.capacity;
            let maxima = &mut self.maxima[index * self.cells..(index + 1) * self.cells];
            for (cell, max) in maxima.iter_mut().enumerate() {
                let mut sum = 0.0;
                for step in 0..*span {
                    let slot = (first + step) % self.capacity;
                    sum += self.buffer[slot * self.cells + cell];
                }
                *max = max.max(sum);
            }
        }
    }

    /// Running maxima laid out `[durations, cells]`. A duration longer than
    /// the samples seen so far reports negative infinity.
    #[must_use]
    pub fn maxima(&self) -> &[f64] {
        &self.maxima
    }

    /// Number of durations tracked
    #[must_use]
    pub fn durations(&self) -> usize {
        self.spans.len()
    }

    /// Rough serialized size
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        ((self.buffer.len() + self.maxima.len()) * 8) as u64
    }
}
