//! Completed statistics handed back to the caller
//!
//! A [`Readout`] is what one completed window produces: the statistic's
//! values, plus the timestamps of the extremes for min/max or the bin edges
//! for histograms. Readouts of consecutive windows are concatenated along
//! time until an output period is full, at which point they leave the engine
//! wrapped in an [`Output`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    clock::Cadence,
    frame::{self, Frame},
};

/// Values of one or more completed windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    /// Statistic values
    pub data: Frame<f64>,
    /// When each extreme occurred, min/max only
    pub timings: Option<Frame<NaiveDateTime>>,
    /// Bin edges, histogram only
    pub bin_edges: Option<Frame<f64>>,
}

impl Readout {
    /// Number of windows held
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no window is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append `other` along time, keeping the companion arrays in lockstep
    ///
    /// # Errors
    ///
    /// Returns an error if the two readouts have different shapes.
    pub fn concat(&mut self, other: Readout) -> Result<(), frame::Error> {
        self.data.concat(other.data)?;
        if let (Some(timings), Some(other)) = (self.timings.as_mut(), other.timings) {
            timings.concat(other)?;
        }
        if let (Some(edges), Some(other)) = (self.bin_edges.as_mut(), other.bin_edges) {
            edges.concat(other)?;
        }
        Ok(())
    }

    /// Keep only the first `len` windows
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        if let Some(timings) = self.timings.as_mut() {
            timings.truncate(len);
        }
        if let Some(edges) = self.bin_edges.as_mut() {
            edges.truncate(len);
        }
    }

    /// Rough serialized size
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        let timings = self.timings.as_ref().map_or(0, |t| t.data.len() * 12);
        let edges = self.bin_edges.as_ref().map_or(0, |e| e.data.len() * 8);
        (self.data.data.len() * 8 + timings + edges) as u64
    }
}

/// What an [`Output`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// A completed statistic, one time slice per window
    Statistic,
    /// Input samples passed through unchanged
    Raw,
    /// Daily aggregate folded into the bias-correction digests
    DailyAggregate,
}

/// A result leaving the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// What this output carries
    pub kind: OutputKind,
    /// Variable name
    pub variable: String,
    /// Statistic name
    pub stat: String,
    /// Window cadence
    pub stat_freq: Cadence,
    /// Statistic values, or raw samples
    pub data: Frame<f64>,
    /// When each extreme occurred, min/max only
    pub timings: Option<Frame<NaiveDateTime>>,
    /// Bin edges, histogram only
    pub bin_edges: Option<Frame<f64>>,
}

impl Output {
    pub(crate) fn new(
        kind: OutputKind,
        variable: &str,
        stat: &str,
        stat_freq: Cadence,
        readout: Readout,
    ) -> Self {
        Self {
            kind,
            variable: variable.to_string(),
            stat: stat.to_string(),
            stat_freq,
            data: readout.data,
            timings: readout.timings,
            bin_edges: readout.bin_edges,
        }
    }

    /// File stem a sink may use for this output, spanning its first and last
    /// timestamps at the resolution of the window cadence.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let format = match self.kind {
            OutputKind::Raw => Cadence::HalfHourly.label_format(),
            OutputKind::Statistic | OutputKind::DailyAggregate => self.stat_freq.label_format(),
        };
        let span = match (self.data.times.first(), self.data.times.last()) {
            (Some(first), Some(last)) if first != last => {
                format!("{}_to_{}", first.format(format), last.format(format))
            }
            (Some(first), _) => first.format(format).to_string(),
            (None, _) => "empty".to_string(),
        };
        format!("{span}_{}_{}_{}", self.variable, self.stat_freq, self.stat)
    }
}
