//! Window admission state machine
//!
//! The [`WindowTracker`] decides, for every timestamp of an incoming batch,
//! whether the sample opens a window, belongs to the open one, was already
//! folded, precedes any window, or rewinds the stream. It is a pure planner:
//! [`WindowTracker::plan`] reads the current [`WindowState`] and the
//! [`AppendState`] and returns the sequence of [`Step`]s the engine must apply
//! to its accumulator and output buffer, together with the state that holds
//! once they are applied. Every error surfaces during planning, before the
//! caller has touched anything, so a failed ingest leaves no trace.
//!
//! # Rules
//!
//! * Timestamps in a batch must strictly increase.
//! * A gap from the previous sample that differs from `time_step` but stays
//!   below twice `time_step` is admitted with a warning and becomes the new
//!   `time_step`; a larger gap is an error. An open window is rebased at that
//!   sample: its remaining samples are counted with the new interval.
//! * A timestamp equal to the last one seen, or earlier but inside the open
//!   window, was already folded and is skipped.
//! * Any other earlier timestamp rewinds: the open window is discarded and
//!   buffered windows at or after the rewound window are forgotten. When the
//!   rewound timestamp cannot open a window the whole output period is
//!   forgotten, and a new one opens with the next window.
//! * A window opens on a sample whose offset into its cadence instance is
//!   less than `time_step`. Samples before the first such sample are trimmed.
//!   Continuous accumulation opens on any sample.
//! * A sample whose position, counted in `time_step`s from the window's
//!   first sample, is below `count` is skipped.
//! * A window completes when `count == n_data`.

use std::ops::Range;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    append::{self, AppendState},
    clock::{Cadence, WindowClock, floor_minute, minutes, minutes_between},
    request::Request,
};

/// Errors produced by [`WindowTracker`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A window's length is not a whole number of samples
    #[error("Window of {minutes} minutes ({cadence}) is not divisible by time_step {time_step}")]
    CadenceArithmetic {
        /// Cadence of the window
        cadence: Cadence,
        /// Length of the window instance
        minutes: u64,
        /// Sampling interval
        time_step: u64,
    },
    /// The output period cannot be filled
    #[error(transparent)]
    Append(#[from] append::Error),
    /// Samples are too far apart
    #[error("Gap of {gap} minutes before {at} exceeds twice the time_step of {time_step}")]
    GapTooLarge {
        /// Observed gap, minutes
        gap: u64,
        /// Sampling interval
        time_step: u64,
        /// Timestamp after the gap
        at: NaiveDateTime,
    },
    /// Timestamps within a batch do not strictly increase
    #[error("Timestamp {at} at index {index} does not follow its predecessor")]
    UnorderedBatch {
        /// Index of the offending timestamp
        index: usize,
        /// The offending timestamp
        at: NaiveDateTime,
    },
}

/// Coarse phase of the open window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No window open
    Empty,
    /// A window is open and short of samples
    Accumulating,
    /// A window holds all its samples
    Full,
}

/// Progress through the current window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Samples folded into the open window
    pub count: u64,
    /// Samples that complete the open window
    pub n_data: u64,
    /// Timestamp of the open window's first sample
    pub start: Option<NaiveDateTime>,
    /// Offset of the first sample into its cadence instance, minutes
    pub start_offset: u64,
    /// Latest timestamp seen
    pub last_seen: Option<NaiveDateTime>,
    /// Length of the open window, minutes
    pub minutes: u64,
    /// Samples folded since accumulation began, for continuous cadence
    pub lifetime_count: u64,
    /// Whether the last checkpoint used the bulk format
    pub bulk: bool,
    /// Sampling interval in effect, minutes
    pub time_step: u64,
    /// Sample positions are counted from here
    pub anchor: Option<NaiveDateTime>,
    /// Samples folded before `anchor`
    pub anchor_count: u64,
}

impl WindowState {
    /// Phase of the open window
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self.start {
            None => Phase::Empty,
            Some(_) if self.n_data > 0 && self.count == self.n_data => Phase::Full,
            Some(_) => Phase::Accumulating,
        }
    }

    fn open(&mut self, at: NaiveDateTime, start_offset: u64, minutes: u64, n_data: u64) {
        self.start = Some(at);
        self.start_offset = start_offset;
        self.minutes = minutes;
        self.n_data = n_data;
        self.count = 0;
        self.anchor = Some(at);
        self.anchor_count = 0;
    }

    fn close(&mut self) {
        self.start = None;
        self.start_offset = 0;
        self.minutes = 0;
        self.n_data = 0;
        self.count = 0;
        self.anchor = None;
        self.anchor_count = 0;
    }

    /// Adopt `time_step`, recounting the open window's remaining samples
    /// from `at`.
    fn adopt(&mut self, at: NaiveDateTime, time_step: u64) {
        self.time_step = time_step;
        if let Some(end) = self.end() {
            if at < end {
                self.anchor = Some(at);
                self.anchor_count = self.count;
                self.n_data = self.count + minutes_between(at, end).div_ceil(time_step);
            }
        }
    }

    /// Position of `at` in the open window
    fn position(&self, at: NaiveDateTime) -> u64 {
        let anchor = self.anchor.or(self.start).unwrap_or(at);
        self.anchor_count + minutes_between(anchor, at) / self.time_step.max(1)
    }

    /// First minute after the open window
    fn end(&self) -> Option<NaiveDateTime> {
        self.start
            .map(|start| floor_minute(start) - minutes(self.start_offset) + minutes(self.minutes))
    }
}

/// One action the engine applies to its accumulator and output buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Discard the open window, and continuous accumulation, keeping the
    /// first `keep` buffered windows
    Rewind { keep: usize },
    /// Discard an open window that can no longer complete
    Abandon,
    /// Discard a buffered output period the next window does not belong to
    DropAppend,
    /// A window opens. `carry` keeps continuous accumulation.
    Open { carry: bool },
    /// Fold these batch rows, with `count_before` samples already folded
    Merge {
        rows: Range<usize>,
        count_before: u64,
    },
    /// The open window is complete. `flush` when the output period is full.
    Complete {
        label: NaiveDateTime,
        count: u64,
        flush: bool,
    },
}

/// Outcome of planning one batch
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plan {
    pub(crate) steps: Vec<Step>,
    pub(crate) window: WindowState,
    pub(crate) append: Option<AppendState>,
}

/// Decides window membership for incoming samples
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTracker {
    clock: WindowClock,
    cadence: Cadence,
    output: Cadence,
    time_step: u64,
    continuous: bool,
    state: WindowState,
}

impl WindowTracker {
    /// Tracker for `request`, with no window open
    #[must_use]
    pub fn new(request: &Request) -> Self {
        Self {
            clock: WindowClock::new(request.time_step, 1),
            cadence: request.tracking_cadence(),
            output: request.output_freq,
            time_step: request.time_step,
            continuous: request.is_continuous(),
            state: WindowState {
                time_step: request.time_step,
                ..WindowState::default()
            },
        }
    }

    /// Current window state
    #[must_use]
    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub(crate) fn commit(&mut self, state: WindowState) {
        self.state = state;
    }

    pub(crate) fn set_bulk(&mut self, bulk: bool) {
        self.state.bulk = bulk;
    }

    /// Plan the admission of `times`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamps are out of order, a gap is too large,
    /// a window is not a whole number of samples, or an output period cannot
    /// hold a whole window.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn plan(
        &self,
        times: &[NaiveDateTime],
        append: Option<&AppendState>,
    ) -> Result<Plan, Error> {
        for (index, pair) in times.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(Error::UnorderedBatch {
                    index: index + 1,
                    at: pair[1],
                });
            }
        }

        let mut window = self.state.clone();
        if window.time_step == 0 {
            window.time_step = self.time_step;
        }
        let mut append = append.cloned();
        let mut steps = Vec::new();
        let mut run: Option<(usize, u64)> = None;
        let mut trimmed = 0usize;
        let mut skipped = 0usize;

        for (row, &at) in times.iter().enumerate() {
            if let Some(last) = window.last_seen {
                if at <= last {
                    let in_window = window.start.is_some_and(|start| at >= start);
                    if at == last || in_window {
                        close_run(&mut steps, &mut run, row);
                        skipped += 1;
                        continue;
                    }

                    close_run(&mut steps, &mut run, row);
                    let rewound = self.clock.minutes_into_window(self.cadence, at);
                    let keep = match append.as_mut() {
                        Some(state) if !self.continuous && rewound.offset < window.time_step => {
                            state.rollback(rewound.start(at))
                        }
                        _ => 0,
                    };
                    if keep == 0 {
                        append = None;
                    }
                    info!(
                        at = %at,
                        last_seen = %last,
                        kept_windows = keep,
                        "Stream rewound, discarding open window"
                    );
                    steps.push(Step::Rewind { keep });
                    window.close();
                    window.last_seen = None;
                    if self.continuous {
                        window.lifetime_count = 0;
                    }
                } else {
                    let step = window.time_step;
                    let gap = minutes_between(last, at);
                    if gap == 0 {
                        // Same minute as the last sample.
                        close_run(&mut steps, &mut run, row);
                        skipped += 1;
                        continue;
                    }
                    if gap != step {
                        if gap < 2 * step {
                            warn!(
                                gap_minutes = gap,
                                time_step = step,
                                at = %at,
                                "Sample gap differs from time_step, adopting it"
                            );
                            window.adopt(at, gap);
                        } else {
                            return Err(Error::GapTooLarge {
                                gap,
                                time_step: step,
                                at,
                            });
                        }
                    }
                }
            }
            window.last_seen = Some(at);

            if let Some(end) = window.end() {
                if at >= end {
                    close_run(&mut steps, &mut run, row);
                    warn!(
                        count = window.count,
                        n_data = window.n_data,
                        at = %at,
                        "Window ended short of samples, discarding it"
                    );
                    steps.push(Step::Abandon);
                    window.close();
                }
            }

            let step = window.time_step;
            let span = self.clock.minutes_into_window(self.cadence, at);
            if window.start.is_none() {
                if !self.continuous && span.offset >= step {
                    trimmed += 1;
                    continue;
                }
                if span.length % step != 0 {
                    return Err(Error::CadenceArithmetic {
                        cadence: self.cadence,
                        minutes: span.length,
                        time_step: step,
                    });
                }

                let window_start = span.start(at);
                if let Some(state) = append.as_ref() {
                    if !state.contains(window_start) {
                        warn!(
                            first = %state.first,
                            appended = state.count_append,
                            expected = state.time_append,
                            "Output period left incomplete, discarding it"
                        );
                        steps.push(Step::DropAppend);
                        append = None;
                    }
                }
                if append.is_none() {
                    append = Some(AppendState::open(
                        &self.clock,
                        self.cadence,
                        self.output,
                        at,
                    )?);
                }

                let n_data = (span.length - span.offset).div_ceil(step);
                steps.push(Step::Open {
                    carry: self.continuous && window.lifetime_count > 0,
                });
                window.open(at, span.offset, span.length, n_data);
            }

            if window.position(at) < window.count {
                close_run(&mut steps, &mut run, row);
                skipped += 1;
                continue;
            }

            if run.is_none() {
                let before = if self.continuous {
                    window.lifetime_count
                } else {
                    window.count
                };
                run = Some((row, before));
            }
            window.count += 1;
            window.lifetime_count += 1;

            if window.count == window.n_data {
                close_run(&mut steps, &mut run, row + 1);
                let label = window.start.unwrap_or(at);
                let flush = append.as_mut().is_some_and(|state| state.record(label));
                if flush {
                    append = None;
                }
                steps.push(Step::Complete {
                    label,
                    count: if self.continuous {
                        window.lifetime_count
                    } else {
                        window.n_data
                    },
                    flush,
                });
                window.close();
            }
        }
        close_run(&mut steps, &mut run, times.len());

        if trimmed > 0 {
            debug!(trimmed, "Samples before the first window start trimmed");
        }
        if skipped > 0 {
            debug!(skipped, "Samples already folded skipped");
        }

        Ok(Plan {
            steps,
            window,
            append,
        })
    }
}

fn close_run(steps: &mut Vec<Step>, run: &mut Option<(usize, u64)>, end: usize) {
    if let Some((start, count_before)) = run.take() {
        if end > start {
            steps.push(Step::Merge {
                rows: start..end,
                count_before,
            });
        }
    }
}
