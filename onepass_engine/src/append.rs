//! Concatenation of completed windows into output periods
//!
//! When the output cadence is coarser than the window cadence, completed
//! windows are held back and concatenated along time until the output period
//! is full. [`AppendState`] is the bookkeeping: how many windows the period
//! holds (`time_append`), how many have been appended (`count_append`) and the
//! label of each. It is small and cheap to clone, so the window tracker plans
//! against a copy of it. [`OutputAppender`] pairs it with the buffered
//! readouts.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Cadence, WindowClock, minutes},
    frame,
    output::Readout,
};

/// Errors produced by [`AppendState`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The output period starting with this window holds no whole window
    #[error("Output cadence '{output}' holds no whole '{window}' window from {at}")]
    InvalidCadenceRatio {
        /// Window cadence
        window: Cadence,
        /// Output cadence
        output: Cadence,
        /// Label of the first window
        at: NaiveDateTime,
    },
}

/// Counters for one output period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendState {
    /// Windows needed to fill the output period
    pub time_append: u64,
    /// Windows appended so far
    pub count_append: u64,
    /// Label of the first window appended
    pub first: NaiveDateTime,
    period_start: NaiveDateTime,
    period_end: NaiveDateTime,
    labels: Vec<NaiveDateTime>,
}

impl AppendState {
    /// Open an output period at the window labelled `first`.
    ///
    /// `time_append` is the number of consecutive `window` instances from the
    /// one containing `first` that end within the `output` instance containing
    /// `first`.
    ///
    /// # Errors
    ///
    /// Returns an error if not one whole window fits.
    pub fn open(
        clock: &WindowClock,
        window: Cadence,
        output: Cadence,
        first: NaiveDateTime,
    ) -> Result<Self, Error> {
        let period = clock.minutes_into_window(output, first);
        let period_start = period.start(first);
        let period_end = period.end(first);

        let mut cursor = clock.minutes_into_window(window, first).start(first);
        let mut time_append = 0;
        while cursor < period_end {
            let next = cursor + minutes(clock.minutes_into_window(window, cursor).length);
            if next > period_end {
                break;
            }
            time_append += 1;
            cursor = next;
        }
        if time_append == 0 {
            return Err(Error::InvalidCadenceRatio { window, output, at: first });
        }

        Ok(Self {
            time_append,
            count_append: 0,
            first,
            period_start,
            period_end,
            labels: Vec::new(),
        })
    }

    /// Whether a window starting at `window_start` belongs to this period
    #[must_use]
    pub fn contains(&self, window_start: NaiveDateTime) -> bool {
        self.period_start <= window_start && window_start < self.period_end
    }

    /// Record a completed window. Returns true when the period is full.
    pub fn record(&mut self, label: NaiveDateTime) -> bool {
        self.labels.push(label);
        self.count_append += 1;
        self.count_append == self.time_append
    }

    /// Forget every window labelled at or after `before`, returning how many
    /// remain.
    pub fn rollback(&mut self, before: NaiveDateTime) -> usize {
        let keep = self.labels.iter().take_while(|l| **l < before).count();
        self.labels.truncate(keep);
        self.count_append = keep as u64;
        keep
    }
}

/// Buffered readouts of the current output period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputAppender {
    state: Option<AppendState>,
    buffer: Option<Readout>,
}

impl OutputAppender {
    /// Counters of the open period, if any
    #[must_use]
    pub fn state(&self) -> Option<&AppendState> {
        self.state.as_ref()
    }

    /// Buffered readouts of the open period, if any
    #[must_use]
    pub fn buffer(&self) -> Option<&Readout> {
        self.buffer.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: Option<AppendState>) {
        self.state = state;
    }

    pub(crate) fn from_parts(state: Option<AppendState>, buffer: Option<Readout>) -> Self {
        Self { state, buffer }
    }

    pub(crate) fn take_buffer(&mut self) -> Option<Readout> {
        self.buffer.take()
    }

    /// Append a completed window's readout
    ///
    /// # Errors
    ///
    /// Returns an error if the readout's shape differs from the buffered one.
    pub fn push(&mut self, readout: Readout) -> Result<(), frame::Error> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.concat(readout),
            None => {
                self.buffer = Some(readout);
                Ok(())
            }
        }
    }

    /// Keep the first `keep` buffered windows, discarding the buffer when
    /// none remain.
    pub fn truncate(&mut self, keep: usize) {
        if keep == 0 {
            self.buffer = None;
        } else if let Some(buffer) = self.buffer.as_mut() {
            buffer.truncate(keep);
        }
    }

    /// Whether a period is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_some() || self.buffer.is_some()
    }

    /// Rough serialized size of the buffer
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        self.buffer.as_ref().map_or(0, Readout::estimated_bytes)
    }
}
