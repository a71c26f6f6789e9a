//! One-pass statistic engine
//!
//! An [`Engine`] owns everything one request needs: the window tracker, the
//! accumulator of the open window, the output appender, and optionally a
//! checkpoint manager and bias-correction rotator. [`Engine::ingest`] plans a
//! batch with the tracker, which fails before anything is touched, then
//! applies the plan and persists the resulting state.

use chrono::NaiveDateTime;
use metrics::counter;
use tracing::{debug, info};

use crate::{
    accumulator::Accumulator,
    append::OutputAppender,
    bias_correction::{self, BiasCorrectionDigestRotator},
    checkpoint::{self, CheckpointManager, DEFAULT_CEILING, SnapshotRef},
    frame::{self, Batch, Frame},
    output::{Output, OutputKind, Readout},
    request::{self, RawRequest, Request, Statistic},
    tracker::{self, Phase, Step, WindowState, WindowTracker},
};

/// Errors produced by [`Engine`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request is invalid
    #[error(transparent)]
    Request(#[from] request::Error),
    /// The batch is malformed or does not match the grid
    #[error(transparent)]
    Frame(#[from] frame::Error),
    /// The batch's timestamps cannot be admitted
    #[error(transparent)]
    Tracker(#[from] tracker::Error),
    /// Checkpoint I/O failed
    #[error(transparent)]
    Checkpoint(#[from] checkpoint::Error),
    /// Monthly digest I/O failed
    #[error(transparent)]
    BiasCorrection(#[from] bias_correction::Error),
    /// The open window has no running statistic behind it
    #[error("No accumulator for the window open at {at}")]
    MissingAccumulator {
        /// Sample or window label that needed it
        at: NaiveDateTime,
    },
}

/// Streaming computation of one statistic
#[derive(Debug)]
pub struct Engine {
    request: Request,
    tracker: WindowTracker,
    accumulator: Option<Accumulator>,
    appender: OutputAppender,
    dims: Option<Vec<usize>>,
    checkpoints: Option<CheckpointManager>,
    rotator: Option<BiasCorrectionDigestRotator>,
}

impl Engine {
    /// Create an engine for `request`, restoring its checkpoint if one
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing checkpoint cannot be read or belongs
    /// to a different request.
    pub fn new(request: Request) -> Result<Self, Error> {
        Self::with_checkpoint_ceiling(request, DEFAULT_CEILING)
    }

    /// Validate `raw` and create an engine for it
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or its checkpoint cannot
    /// be restored.
    pub fn from_raw(raw: RawRequest) -> Result<Self, Error> {
        Self::new(Request::try_from(raw)?)
    }

    /// Create an engine whose checkpoints and monthly digests switch to the
    /// bulk format above `ceiling` estimated bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing checkpoint cannot be read or belongs
    /// to a different request.
    pub fn with_checkpoint_ceiling(request: Request, ceiling: u64) -> Result<Self, Error> {
        let checkpoints = request
            .checkpoint_filepath
            .as_ref()
            .map(|dir| CheckpointManager::new(dir, &request).with_ceiling(ceiling));
        let rotator = match (&request.statistic, &request.save_filepath) {
            (Statistic::BiasCorrection { .. }, Some(dir)) => {
                Some(BiasCorrectionDigestRotator::new(dir, &request).with_ceiling(ceiling))
            }
            _ => None,
        };

        let mut engine = Self {
            tracker: WindowTracker::new(&request),
            accumulator: None,
            appender: OutputAppender::default(),
            dims: None,
            checkpoints,
            rotator,
            request,
        };
        if let Some(manager) = engine.checkpoints.as_ref() {
            if let Some(snapshot) = manager.load(&engine.request)? {
                engine.tracker.commit(snapshot.window);
                engine.dims = snapshot.dims;
                engine.accumulator = snapshot.accumulator;
                engine.appender = OutputAppender::from_parts(snapshot.append, snapshot.buffer);
            }
        }

        info!(
            stat = engine.request.statistic.name(),
            stat_freq = %engine.request.stat_freq,
            output_freq = %engine.request.output_freq,
            time_step = engine.request.time_step,
            variable = %engine.request.variable,
            "Engine ready"
        );
        Ok(engine)
    }

    /// The validated request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Counters of the open window
    #[must_use]
    pub fn window(&self) -> &WindowState {
        self.tracker.state()
    }

    /// Phase of the open window
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.tracker.state().phase()
    }

    /// Running statistic of the open window, if any
    #[must_use]
    pub fn accumulator(&self) -> Option<&Accumulator> {
        self.accumulator.as_ref()
    }

    /// Buffered output period
    #[must_use]
    pub fn appender(&self) -> &OutputAppender {
        &self.appender
    }

    /// Fold `batch` in, returning every output it completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is malformed, does not match the grid,
    /// cannot be admitted by the window tracker, or persisting state fails.
    /// Every error but persistence leaves the engine untouched.
    pub fn ingest(&mut self, batch: &Batch) -> Result<Vec<Output>, Error> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if self.request.statistic == Statistic::Raw {
            counter!("outputs_emitted").increment(1);
            return Ok(vec![self.output(OutputKind::Raw, plain(batch.clone()))]);
        }
        if let Some(dims) = self.dims.as_ref() {
            if *dims != batch.dims {
                return Err(frame::Error::ShapeMismatch {
                    expected: dims.clone(),
                    found: batch.dims.clone(),
                }
                .into());
            }
        }

        let plan = self.tracker.plan(&batch.times, self.appender.state())?;
        self.dims = Some(batch.dims.clone());
        self.tracker.commit(plan.window);
        self.appender.set_state(plan.append);

        let continuous = self.request.is_continuous();
        let bias = matches!(self.request.statistic, Statistic::BiasCorrection { .. });
        let mut outputs = Vec::new();
        let mut days = Vec::new();
        let mut rewound = false;

        for step in plan.steps {
            match step {
                Step::Rewind { keep } => {
                    self.appender.truncate(keep);
                    self.accumulator = None;
                    rewound = true;
                }
                Step::Abandon => {
                    if !continuous {
                        self.accumulator = None;
                    }
                }
                Step::DropAppend => self.appender.truncate(0),
                Step::Open { carry } => {
                    if !carry || self.accumulator.is_none() {
                        self.accumulator = Some(Accumulator::new(
                            &self.request.statistic,
                            batch.cells(),
                            self.tracker.state().time_step,
                            self.request.compression,
                        ));
                    }
                }
                Step::Merge { rows, count_before } => {
                    let part = batch.slice(rows);
                    let Some(accumulator) = self.accumulator.as_mut() else {
                        return Err(Error::MissingAccumulator { at: part.times[0] });
                    };
                    accumulator.merge(&part, count_before);
                    if bias {
                        outputs.push(self.output(OutputKind::Raw, plain(part)));
                    }
                }
                Step::Complete { label, count, flush } => {
                    let Some(accumulator) = self.accumulator.as_ref() else {
                        return Err(Error::MissingAccumulator { at: label });
                    };
                    let readout =
                        accumulator.finalise(&self.request.statistic, count, label, &batch.dims);
                    counter!("windows_completed").increment(1);
                    debug!(label = %label, count, "Window complete");
                    if !continuous {
                        self.accumulator = None;
                    }
                    if bias {
                        days.push(readout.data.clone());
                    }
                    self.appender.push(readout)?;

                    if flush {
                        if let Some(buffer) = self.appender.take_buffer() {
                            let kind = if bias {
                                OutputKind::DailyAggregate
                            } else {
                                OutputKind::Statistic
                            };
                            counter!("outputs_emitted").increment(1);
                            outputs.push(self.output(kind, buffer));
                        }
                    }
                }
            }
        }

        if let Some(rotator) = self.rotator.as_ref() {
            for day in &days {
                rotator.update(day)?;
            }
        }
        self.persist(rewound)?;
        Ok(outputs)
    }

    fn output(&self, kind: OutputKind, readout: Readout) -> Output {
        Output::new(
            kind,
            &self.request.variable,
            self.request.statistic.name(),
            self.request.stat_freq,
            readout,
        )
    }

    fn persist(&mut self, rewound: bool) -> Result<(), Error> {
        let Some(manager) = self.checkpoints.as_ref() else {
            return Ok(());
        };
        if rewound {
            manager.remove()?;
        }

        let state = self.tracker.state();
        let live = state.start.is_some()
            || self.appender.is_open()
            || (self.request.is_continuous() && state.lifetime_count > 0);
        if !live {
            manager.remove()?;
            return Ok(());
        }

        let bytes = self
            .accumulator
            .as_ref()
            .map_or(0, Accumulator::estimated_bytes)
            + self.appender.estimated_bytes();
        self.tracker.set_bulk(manager.is_bulk(bytes));
        manager.save(&SnapshotRef {
            request: &self.request,
            dims: self.dims.as_deref(),
            window: self.tracker.state(),
            append: self.appender.state(),
            accumulator: self.accumulator.as_ref(),
            buffer: self.appender.buffer(),
        })?;
        Ok(())
    }
}

fn plain(data: Frame<f64>) -> Readout {
    Readout {
        data,
        timings: None,
        bin_edges: None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        clock::Cadence,
        request::{self, OneOrMany, PercentileList},
        test::batches::{self, at},
    };
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn engine(raw: RawRequest) -> Engine {
        Engine::from_raw(raw).unwrap()
    }

    fn with_checkpoints(mut raw: RawRequest, dir: &Path) -> RawRequest {
        raw.checkpoint = Some(true);
        raw.checkpoint_filepath = Some(dir.to_path_buf());
        raw
    }

    fn feed(engine: &mut Engine, batch: &Batch, lengths: &[usize]) -> Vec<Output> {
        batches::split(batch, lengths)
            .iter()
            .flat_map(|part| engine.ingest(part).unwrap())
            .collect()
    }

    #[test]
    fn daily_mean_one_sample_at_a_time() {
        let mut engine = engine(request::raw("mean", "daily", "daily", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 24, &[3, 3], |t, c| {
            (t * 9 + c) as f64
        });
        let outputs = feed(&mut engine, &batch, &[1; 24]);

        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.kind, OutputKind::Statistic);
        assert_eq!(output.data.times, vec![at(2021, 1, 1, 0, 0)]);
        assert_eq!(output.data.dims, vec![3, 3]);
        for (cell, value) in output.data.data.iter().enumerate() {
            assert_relative_eq!(*value, 11.5 * 9.0 + cell as f64, epsilon = 1e-10);
        }
        assert_eq!(engine.phase(), Phase::Empty);
    }

    #[test]
    fn daily_windows_fill_a_month() {
        let mut engine = engine(request::raw("max", "daily", "monthly", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 31 * 24 + 3, &[1], |t, _| {
            (t % 24) as f64
        });
        let outputs = feed(&mut engine, &batch, &[50; 15]);

        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.data.len(), 31);
        assert!(output.data.data.iter().all(|v| *v == 23.0));
        let timings = output.timings.as_ref().unwrap();
        assert_eq!(timings.data[0], at(2021, 1, 1, 23, 0));
        assert_eq!(output.file_stem(), "2021_01_01_to_2021_01_31_tas_daily_max");
        assert_eq!(engine.window().count, 3);
    }

    #[test]
    fn daily_means_fill_a_month() {
        let mut engine = engine(request::raw("mean", "daily", "monthly", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 31 * 24, &[2], |t, c| {
            (t * 2 + c) as f64
        });
        let outputs = feed(&mut engine, &batch, &[40; 19]);

        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.data.len(), 31);
        for day in 0..31 {
            assert_eq!(output.data.times[day], at(2021, 1, 1, 0, 0) + chrono::TimeDelta::days(day as i64));
            for cell in 0..2 {
                let expected = (0..24)
                    .map(|hour| ((day * 24 + hour) * 2 + cell) as f64)
                    .sum::<f64>()
                    / 24.0;
                assert_relative_eq!(output.data.data[day * 2 + cell], expected, epsilon = 1e-10);
            }
        }
        assert_eq!(engine.phase(), Phase::Empty);
    }

    #[test]
    fn mid_day_rewind_restarts_the_month() {
        let mut engine = engine(request::raw("mean", "daily", "monthly", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 31 * 24 + 24, &[1], |t, _| {
            (t % 24) as f64
        });
        assert!(engine.ingest(&batch.slice(0..24 * 3 + 5)).unwrap().is_empty());

        // Back to Jan 3 12:00, then on to the end of January.
        let outputs = engine.ingest(&batch.slice(24 * 2 + 12..31 * 24)).unwrap();
        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.data.len(), 28);
        assert_eq!(output.data.times[0], at(2021, 1, 4, 0, 0));
        assert!(output.data.data.iter().all(|v| (*v - 11.5).abs() < 1e-10));
        assert!(!engine.appender().is_open());

        let outputs = engine.ingest(&batch.slice(31 * 24..31 * 24 + 24)).unwrap();
        assert!(outputs.is_empty());
        let state = engine.appender().state().unwrap();
        assert_eq!((state.count_append, state.time_append), (1, 28));
    }

    #[test]
    fn wider_sampling_adopted() {
        let mut engine = engine(request::raw("mean", "daily", "daily", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 90, 48, &[1], |t, _| t as f64);
        let outputs = feed(&mut engine, &batch, &[7; 7]);

        assert_eq!(outputs.len(), 3);
        for (day, output) in outputs.iter().enumerate() {
            let expected = (day * 16..day * 16 + 16).sum::<usize>() as f64 / 16.0;
            assert_relative_eq!(output.data.data[0], expected, epsilon = 1e-10);
        }
        assert_eq!(engine.window().time_step, 90);
        assert_eq!(engine.request().time_step, 60);
    }

    #[test]
    fn narrower_sampling_adopted() {
        let mut engine = engine(request::raw("sum", "daily", "daily", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 30, 48, &[1], |_, _| 1.0);
        let outputs = feed(&mut engine, &batch, &[5; 10]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].data.data, vec![48.0]);
    }

    #[test]
    fn threshold_exceedances_counted() {
        let mut raw = request::raw("thresh_exceed", "daily", "daily", 60);
        raw.thresh_exceed = Some(OneOrMany::Many(vec![0.5]));
        let mut engine = engine(raw);
        let values: Vec<f64> = (0..24).map(|i| if i % 5 == 0 { 0.5 } else { 0.1 }).collect();
        let outputs = feed(&mut engine, &batches::column(&values), &[7, 7]);
        assert_eq!(outputs[0].data.dims, vec![1, 1]);
        assert_eq!(outputs[0].data.data, vec![5.0]);
    }

    #[test]
    fn continuous_mean_spans_periods() {
        let mut engine = engine(request::raw("mean", "continuous", "daily", 60));
        let values: Vec<f64> = (0..48).map(f64::from).collect();
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 48, &[1], |t, _| values[t]);
        let outputs = feed(&mut engine, &batch, &[10, 20]);

        assert_eq!(outputs.len(), 2);
        assert_relative_eq!(outputs[0].data.data[0], 11.5, epsilon = 1e-10);
        assert_relative_eq!(outputs[1].data.data[0], 23.5, epsilon = 1e-10);
        assert_eq!(outputs[1].data.times, vec![at(2021, 1, 2, 0, 0)]);
        assert!(engine.accumulator().is_some());
    }

    #[test]
    fn iams_over_a_year() {
        let mut raw = request::raw("iams", "yearly", "yearly", 60);
        raw.durations = Some(vec![60, 120, 90]);
        let mut engine = engine(raw);
        let len = 365 * 24;
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, len, &[1], |t, _| match t {
            1_000 => 5.0,
            1_001 => 4.0,
            4_000 => 6.0,
            _ => 0.0,
        });
        let outputs = feed(&mut engine, &batch, &[1_000; 9]);

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].data.dims, vec![2, 1]);
        assert_eq!(outputs[0].data.data, vec![6.0, 9.0]);
    }

    #[test]
    fn percentile_and_histogram() {
        let values: Vec<f64> = (1..=24).map(f64::from).collect();

        let mut raw = request::raw("percentile", "daily", "daily", 60);
        raw.percentile_list = Some(PercentileList::Values(vec![0.5]));
        let outputs = feed(&mut engine(raw), &batches::column(&values), &[5]);
        assert_relative_eq!(outputs[0].data.data[0], 12.5, epsilon = 1.0);

        let mut raw = request::raw("histogram", "daily", "daily", 60);
        raw.bins = Some(4);
        raw.range = Some([0.0, 24.0]);
        let outputs = feed(&mut engine(raw), &batches::column(&values), &[5]);
        let output = &outputs[0];
        assert_eq!(output.data.dims, vec![4, 1]);
        let edges = output.bin_edges.as_ref().unwrap();
        assert_eq!(edges.data, vec![0.0, 6.0, 12.0, 18.0, 24.0]);
        let total: f64 = output.data.data.iter().sum();
        assert_relative_eq!(total, 24.0, epsilon = 1e-6);
    }

    #[test]
    fn bias_correction_updates_monthly_digests() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = request::raw("bias_correction", "daily", "daily", 60);
        raw.variable = Some("pr".to_string());
        raw.save = Some(true);
        raw.save_filepath = Some(dir.path().to_path_buf());
        let mut engine = engine(raw);

        let batch = batches::regular(at(2021, 1, 31, 0, 0), 60, 48, &[2], |_, _| 0.5);
        let outputs = feed(&mut engine, &batch, &[30]);

        let raw_slices: usize = outputs
            .iter()
            .filter(|o| o.kind == OutputKind::Raw)
            .map(|o| o.data.len())
            .sum();
        assert_eq!(raw_slices, 48);
        let daily: Vec<&Output> = outputs
            .iter()
            .filter(|o| o.kind == OutputKind::DailyAggregate)
            .collect();
        assert_eq!(daily.len(), 2);
        assert_relative_eq!(daily[0].data.data[0], 12.0, epsilon = 1e-10);

        let rotator = engine.rotator.as_ref().unwrap();
        assert!(rotator.month_path(1, false).exists());
        assert!(rotator.month_path(2, false).exists());
        assert_eq!(rotator.load(2, 2).unwrap().count(1), 1.0);
    }

    #[test]
    fn raw_passes_through() {
        let mut engine = engine(request::raw("raw", "hourly", "hourly", 60));
        let batch = batches::column(&[1.0, 2.0, 3.0]);
        let outputs = engine.ingest(&batch).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Raw);
        assert_eq!(outputs[0].data, batch);
        assert_eq!(outputs[0].file_stem(), "2021_01_01_T00_00_to_2021_01_01_T02_00_tas_hourly_raw");
    }

    #[test]
    fn shape_change_rejected_without_side_effects() {
        let mut engine = engine(request::raw("mean", "daily", "daily", 60));
        engine.ingest(&batches::column(&[1.0, 2.0])).unwrap();
        let wide = batches::regular(at(2021, 1, 1, 2, 0), 60, 1, &[2], |_, _| 1.0);
        let err = engine.ingest(&wide).unwrap_err();
        assert!(matches!(err, Error::Frame(frame::Error::ShapeMismatch { .. })));
        assert_eq!(engine.window().count, 2);
    }

    #[test]
    fn gap_error_leaves_engine_untouched() {
        let mut engine = engine(request::raw("sum", "daily", "daily", 60));
        engine.ingest(&batches::column(&[1.0, 2.0])).unwrap();
        let before = engine.accumulator().cloned();
        let late = batches::regular(at(2021, 1, 1, 6, 0), 60, 1, &[1], |_, _| 1.0);
        assert!(matches!(
            engine.ingest(&late),
            Err(Error::Tracker(tracker::Error::GapTooLarge { .. }))
        ));
        assert_eq!(engine.accumulator().cloned(), before);
        assert_eq!(engine.window().last_seen, Some(at(2021, 1, 1, 1, 0)));
    }

    #[test]
    fn rewind_recomputes_without_double_counting() {
        let mut engine = engine(request::raw("sum", "daily", "daily", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 30, &[1], |_, _| 1.0);
        let first = engine.ingest(&batch).unwrap();
        assert_eq!(first[0].data.data, vec![24.0]);
        assert_eq!(engine.window().count, 6);

        let again = engine.ingest(&batch).unwrap();
        assert_eq!(again, first);
        assert_eq!(engine.window().count, 6);
        assert_eq!(engine.window().start, Some(at(2021, 1, 2, 0, 0)));
    }

    #[test]
    fn replay_inside_window_not_double_counted() {
        let mut engine = engine(request::raw("sum", "daily", "daily", 60));
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 24, &[1], |_, _| 1.0);
        engine.ingest(&batch.slice(0..10)).unwrap();
        engine.ingest(&batch.slice(5..12)).unwrap();
        let outputs = engine.ingest(&batch.slice(12..24)).unwrap();
        assert_eq!(outputs[0].data.data, vec![24.0]);
    }

    #[test]
    fn checkpoint_follows_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let raw = with_checkpoints(request::raw("mean", "daily", "daily", 60), dir.path());
        let mut engine = engine(raw);
        let blob = engine.checkpoints.as_ref().unwrap().blob_path();
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 24, &[1], |t, _| t as f64);

        engine.ingest(&batch.slice(0..12)).unwrap();
        assert!(blob.exists());
        engine.ingest(&batch.slice(12..24)).unwrap();
        assert!(!blob.exists());
    }

    #[test]
    fn rewind_rewrites_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let raw = with_checkpoints(request::raw("sum", "daily", "daily", 60), dir.path());
        let mut engine = engine(raw.clone());
        let blob = engine.checkpoints.as_ref().unwrap().blob_path();
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 30, &[1], |_, _| 1.0);

        engine.ingest(&batch).unwrap();
        assert_eq!(Engine::from_raw(raw.clone()).unwrap().window().start, Some(at(2021, 1, 2, 0, 0)));

        // Rewinding to a window start leaves the re-opened window on disk.
        engine.ingest(&batch.slice(0..3)).unwrap();
        let restored = Engine::from_raw(raw.clone()).unwrap();
        assert_eq!(restored.window().start, Some(at(2021, 1, 1, 0, 0)));
        assert_eq!(restored.window().count, 3);

        engine.ingest(&batch.slice(3..26)).unwrap();
        assert!(blob.exists());

        // Rewinding into the middle of a day leaves nothing to restore.
        engine.ingest(&batch.slice(12..13)).unwrap();
        assert_eq!(engine.phase(), Phase::Empty);
        assert!(!blob.exists());
    }

    #[test]
    fn restart_resumes_mid_window() {
        let dir = tempfile::tempdir().unwrap();
        let raw = with_checkpoints(request::raw("var", "daily", "weekly", 60), dir.path());
        // 2021-01-04 is a Monday.
        let batch = batches::regular(at(2021, 1, 4, 0, 0), 60, 7 * 24, &[2], |t, c| {
            ((t * 7 + c * 3) % 11) as f64
        });

        let mut uninterrupted = engine(raw.clone());
        let expected = feed(&mut uninterrupted, &batch, &[100]);

        let mut first = engine(raw.clone());
        let mut outputs = first.ingest(&batch.slice(0..100)).unwrap();
        drop(first);
        let mut second = engine(raw);
        assert_eq!(second.window().count, 4);
        assert_eq!(second.appender().state().unwrap().count_append, 4);
        outputs.extend(second.ingest(&batch.slice(100..168)).unwrap());

        assert_eq!(outputs, expected);
        assert_eq!(outputs[0].data.len(), 7);
    }

    #[test]
    fn bulk_checkpoint_restores() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = with_checkpoints(request::raw("percentile", "daily", "daily", 60), dir.path());
        raw.percentile_list = Some(PercentileList::Values(vec![0.1, 0.9]));
        let request = Request::try_from(raw).unwrap();
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 24, &[2], |t, c| (t + c) as f64);

        let mut uninterrupted = Engine::new(request.clone()).unwrap();
        uninterrupted.checkpoints = None;
        let expected = uninterrupted.ingest(&batch).unwrap();

        let mut first = Engine::with_checkpoint_ceiling(request.clone(), 0).unwrap();
        first.ingest(&batch.slice(0..9)).unwrap();
        assert!(first.window().bulk);
        drop(first);
        let mut second = Engine::with_checkpoint_ceiling(request, 0).unwrap();
        let outputs = second.ingest(&batch.slice(9..24)).unwrap();
        assert_eq!(outputs, expected);
    }

    #[test]
    fn missing_bulk_slot_fails_restart() {
        let dir = tempfile::tempdir().unwrap();
        let raw = with_checkpoints(request::raw("mean", "daily", "daily", 60), dir.path());
        let request = Request::try_from(raw).unwrap();
        let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 24, &[1], |t, _| t as f64);

        let mut first = Engine::with_checkpoint_ceiling(request.clone(), 0).unwrap();
        first.ingest(&batch.slice(0..10)).unwrap();
        assert!(first.window().bulk);
        drop(first);

        let slot = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| path.to_string_lossy().ends_with("_accumulator.zst"))
            .unwrap();
        std::fs::remove_file(slot).unwrap();

        assert!(matches!(
            Engine::with_checkpoint_ceiling(request, 0),
            Err(Error::Checkpoint(checkpoint::Error::MissingSlot { .. }))
        ));
    }

    #[test]
    fn merge_without_accumulator_is_an_error() {
        let mut engine = engine(request::raw("mean", "daily", "daily", 60));
        let batch = batches::column(&[1.0, 2.0, 3.0]);
        engine.ingest(&batch.slice(0..2)).unwrap();
        engine.accumulator = None;
        assert!(matches!(
            engine.ingest(&batch.slice(2..3)),
            Err(Error::MissingAccumulator { .. })
        ));
    }

    #[test]
    fn checkpoint_of_other_request_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let raw = with_checkpoints(request::raw("mean", "daily", "daily", 60), dir.path());
        let mut engine = engine(raw.clone());
        engine.ingest(&batches::column(&[1.0])).unwrap();

        let mut other = raw;
        other.compression = Some(5.0);
        assert!(matches!(
            Engine::from_raw(other),
            Err(Error::Checkpoint(checkpoint::Error::IncompatibleCheckpoint { .. }))
        ));
    }

    #[test]
    fn request_errors_surface() {
        let raw = request::raw("mean", "monthly", "daily", 60);
        assert!(matches!(Engine::from_raw(raw), Err(Error::Request(_))));
        let engine = engine(request::raw("mean", "3hourly", "daily", 60));
        assert_eq!(engine.request().stat_freq, Cadence::ThreeHourly);
    }

    proptest! {
        #[test]
        fn restarts_do_not_change_outputs(
            lengths in prop::collection::vec(1usize..20, 1..12),
            restarts in prop::collection::vec(any::<bool>(), 12),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let raw = with_checkpoints(request::raw("std", "3hourly", "daily", 60), dir.path());
            let batch = batches::regular(at(2021, 1, 1, 0, 0), 60, 60, &[2], |t, c| {
                ((t * 13 + c * 5) % 17) as f64
            });
            let parts = batches::split(&batch, &lengths);

            let mut reference = Engine::from_raw(request::raw("std", "3hourly", "daily", 60)).unwrap();
            let mut expected = Vec::new();
            for part in &parts {
                expected.extend(reference.ingest(part).unwrap());
            }

            let mut engine = Engine::from_raw(raw.clone()).unwrap();
            let mut outputs = Vec::new();
            for (index, part) in parts.iter().enumerate() {
                if restarts.get(index).copied().unwrap_or(false) {
                    drop(engine);
                    engine = Engine::from_raw(raw.clone()).unwrap();
                }
                outputs.extend(engine.ingest(part).unwrap());
            }
            prop_assert_eq!(outputs, expected);
        }
    }
}
