//! Statistic requests
//!
//! A [`RawRequest`] is the user-facing shape of a request, as deserialized
//! from configuration. Converting it into a [`Request`] validates every key
//! once, applies defaults and logs each default it had to fill in. Nothing
//! downstream re-validates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{self, Cadence};

/// Durations, in minutes, over which annual maxima are computed when the
/// request does not list its own.
pub const DEFAULT_DURATIONS: [u64; 22] = [
    5, 10, 15, 20, 30, 45, 60, 90, 120, 180, 240, 360, 540, 720, 1_080, 1_440, 2_880, 4_320,
    5_760, 7_200, 8_640, 10_080,
];

/// Histogram bins used when the request does not set `bins`.
pub const DEFAULT_BINS: usize = 10;

/// Digest compression used when the request does not set `compression`.
pub const DEFAULT_COMPRESSION: f64 = 1.0;

/// Variables aggregated by daily sum, rather than mean, for bias correction.
const PRECIPITATION_VARIABLES: [&str; 9] = [
    "pr",
    "lsp",
    "cp",
    "tp",
    "pre",
    "precip",
    "rain",
    "precipitation",
    "precipitationCal",
];

/// Errors produced by request validation
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A required key is absent
    #[error("Request must include key '{0}'")]
    MissingKey(&'static str),
    /// The statistic name is unknown
    #[error("Unsupported stat '{0}', valid values are: {STATISTIC_NAMES}")]
    UnknownStatistic(String),
    /// A cadence name could not be parsed
    #[error(transparent)]
    Cadence(#[from] clock::Error),
    /// The window and output cadences do not fit together
    #[error("Output cadence '{output}' cannot hold whole '{window}' windows")]
    InvalidPairing {
        /// Window cadence
        window: Cadence,
        /// Output cadence
        output: Cadence,
    },
    /// A key is present but its value is unusable
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Offending key
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

const STATISTIC_NAMES: &str = "mean, std, var, min, max, sum, thresh_exceed, percentile, \
                               histogram, iams, bias_correction, raw";

/// One or many numbers, as `thresh_exceed` accepts either form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single value
    One(f64),
    /// A list of values
    Many(Vec<f64>),
}

/// Percentiles to extract, either an explicit list or a keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PercentileList {
    /// Explicit quantiles in `[0, 1]`
    Values(Vec<f64>),
    /// `"all"`, the whole distribution
    Keyword(String),
    /// `["all"]`, the whole distribution
    Keywords(Vec<String>),
}

/// Request as supplied by the user, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRequest {
    /// Statistic name
    pub stat: Option<String>,
    /// Window cadence name
    pub stat_freq: Option<String>,
    /// Output cadence name, defaults to `stat_freq`
    pub output_freq: Option<String>,
    /// Sampling interval of the input, minutes
    pub time_step: Option<u64>,
    /// Name of the variable being accumulated
    pub variable: Option<String>,
    /// Whether outputs are persisted by the caller
    pub save: Option<bool>,
    /// Whether the engine checkpoints its state
    pub checkpoint: Option<bool>,
    /// Output directory, required when `save` is true
    pub save_filepath: Option<PathBuf>,
    /// Checkpoint directory, required when `checkpoint` is true
    pub checkpoint_filepath: Option<PathBuf>,
    /// Exceedance thresholds for `thresh_exceed`
    pub thresh_exceed: Option<OneOrMany>,
    /// Quantiles for `percentile`
    pub percentile_list: Option<PercentileList>,
    /// Bin count for `histogram`
    pub bins: Option<usize>,
    /// Fixed `[low, high]` range for `histogram`
    pub range: Option<[f64; 2]>,
    /// Digest compression for distributional statistics
    pub compression: Option<f64>,
    /// Durations, minutes, for `iams`
    pub durations: Option<Vec<u64>>,
    /// `sum` or `mean`, overriding the variable-based default for
    /// `bias_correction`
    pub bias_adjust_aggregation: Option<String>,
}

/// Daily aggregation feeding the bias-correction digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Daily sum
    Sum,
    /// Daily mean
    Mean,
}

/// The statistic an engine computes, with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statistic {
    /// Arithmetic mean
    Mean,
    /// Sample standard deviation
    Std,
    /// Sample variance
    Var,
    /// Minimum and when it occurred
    Min,
    /// Maximum and when it occurred
    Max,
    /// Sum
    Sum,
    /// Count of samples at or above each threshold
    ThreshExceed {
        /// Thresholds, in request order
        thresholds: Vec<f64>,
    },
    /// Quantiles from a per-cell digest
    Percentile {
        /// Quantiles in `[0, 1]`
        quantiles: Vec<f64>,
    },
    /// Histogram from a per-cell digest
    Histogram {
        /// Bin count
        bins: usize,
        /// Fixed range, else each cell's min and max
        range: Option<(f64, f64)>,
    },
    /// Annual maximum of sliding sums over fixed durations
    Iams {
        /// Durations, minutes, all multiples of the time step
        durations: Vec<u64>,
    },
    /// Monthly reference digests of daily aggregates
    BiasCorrection {
        /// Daily aggregation
        aggregation: Aggregation,
    },
    /// Pass-through
    Raw,
}

impl Statistic {
    /// Configuration name of this statistic
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Std => "std",
            Statistic::Var => "var",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Sum => "sum",
            Statistic::ThreshExceed { .. } => "thresh_exceed",
            Statistic::Percentile { .. } => "percentile",
            Statistic::Histogram { .. } => "histogram",
            Statistic::Iams { .. } => "iams",
            Statistic::BiasCorrection { .. } => "bias_correction",
            Statistic::Raw => "raw",
        }
    }

    /// Whether this statistic is backed by per-cell digests
    #[must_use]
    pub fn uses_digests(&self) -> bool {
        matches!(
            self,
            Statistic::Percentile { .. }
                | Statistic::Histogram { .. }
                | Statistic::BiasCorrection { .. }
        )
    }
}

/// A validated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Statistic and its parameters
    pub statistic: Statistic,
    /// Window cadence
    pub stat_freq: Cadence,
    /// Output cadence
    pub output_freq: Cadence,
    /// Sampling interval of the input, minutes
    pub time_step: u64,
    /// Name of the variable being accumulated
    pub variable: String,
    /// Output directory when saving is enabled
    pub save_filepath: Option<PathBuf>,
    /// Checkpoint directory when checkpointing is enabled
    pub checkpoint_filepath: Option<PathBuf>,
    /// Digest compression
    pub compression: f64,
}

impl Request {
    /// Whether windows accumulate without ever resetting
    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.stat_freq == Cadence::Continuous
    }

    /// The cadence whose instances the window tracker follows. Continuous
    /// accumulation is tracked, and emitted, per output period.
    #[must_use]
    pub fn tracking_cadence(&self) -> Cadence {
        if self.is_continuous() {
            self.output_freq
        } else {
            self.stat_freq
        }
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = Error;

    #[allow(clippy::too_many_lines)]
    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let stat = raw.stat.ok_or(Error::MissingKey("stat"))?;
        let stat_freq: Cadence = raw
            .stat_freq
            .as_deref()
            .ok_or(Error::MissingKey("stat_freq"))?
            .parse()?;
        let save = raw.save.ok_or(Error::MissingKey("save"))?;
        let checkpoint = raw.checkpoint.ok_or(Error::MissingKey("checkpoint"))?;

        let output_freq = match raw.output_freq.as_deref() {
            Some(name) => name.parse()?,
            None if stat_freq == Cadence::Continuous => {
                return Err(Error::MissingKey("output_freq"));
            }
            None => {
                info!(stat_freq = %stat_freq, "No output_freq given, defaulting to stat_freq");
                stat_freq
            }
        };
        if output_freq == Cadence::Continuous || !stat_freq.nests_in(output_freq) {
            return Err(Error::InvalidPairing {
                window: stat_freq,
                output: output_freq,
            });
        }

        let save_filepath = required_path(save, raw.save_filepath, "save_filepath")?;
        let checkpoint_filepath =
            required_path(checkpoint, raw.checkpoint_filepath, "checkpoint_filepath")?;

        let is_raw = stat == "raw";
        let time_step = match raw.time_step {
            Some(0) => {
                return Err(Error::InvalidValue {
                    key: "time_step",
                    reason: "must be greater than zero".to_string(),
                });
            }
            Some(step) => step,
            None if is_raw => 1,
            None => return Err(Error::MissingKey("time_step")),
        };
        let variable = match raw.variable {
            Some(variable) => variable,
            None if is_raw => "raw".to_string(),
            None => return Err(Error::MissingKey("variable")),
        };

        let statistic = match stat.as_str() {
            "mean" => Statistic::Mean,
            "std" => Statistic::Std,
            "var" => Statistic::Var,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "sum" => Statistic::Sum,
            "raw" => Statistic::Raw,
            "thresh_exceed" => {
                let thresholds = match raw.thresh_exceed {
                    Some(OneOrMany::One(value)) => vec![value],
                    Some(OneOrMany::Many(values)) if !values.is_empty() => values,
                    Some(OneOrMany::Many(_)) => {
                        return Err(Error::InvalidValue {
                            key: "thresh_exceed",
                            reason: "at least one threshold is required".to_string(),
                        });
                    }
                    None => return Err(Error::MissingKey("thresh_exceed")),
                };
                Statistic::ThreshExceed { thresholds }
            }
            "percentile" => Statistic::Percentile {
                quantiles: quantiles(raw.percentile_list)?,
            },
            "histogram" => {
                let bins = match raw.bins {
                    Some(0) => {
                        return Err(Error::InvalidValue {
                            key: "bins",
                            reason: "must be greater than zero".to_string(),
                        });
                    }
                    Some(bins) => bins,
                    None => {
                        info!(bins = DEFAULT_BINS, "No bins given for histogram, using default");
                        DEFAULT_BINS
                    }
                };
                let range = match raw.range {
                    Some([low, high]) if low < high => Some((low, high)),
                    Some([low, high]) => {
                        return Err(Error::InvalidValue {
                            key: "range",
                            reason: format!("low {low} must be below high {high}"),
                        });
                    }
                    None => None,
                };
                Statistic::Histogram { bins, range }
            }
            "iams" => {
                if stat_freq != Cadence::Yearly || output_freq != Cadence::Yearly {
                    return Err(Error::InvalidPairing {
                        window: stat_freq,
                        output: output_freq,
                    });
                }
                let candidates = raw.durations.unwrap_or_else(|| DEFAULT_DURATIONS.to_vec());
                let durations: Vec<u64> = candidates
                    .into_iter()
                    .filter(|d| *d >= time_step && d % time_step == 0)
                    .collect();
                if durations.is_empty() {
                    return Err(Error::InvalidValue {
                        key: "durations",
                        reason: format!("no duration is a multiple of time_step {time_step}"),
                    });
                }
                Statistic::Iams { durations }
            }
            "bias_correction" => {
                if stat_freq != Cadence::Daily || output_freq != Cadence::Daily {
                    return Err(Error::InvalidPairing {
                        window: stat_freq,
                        output: output_freq,
                    });
                }
                if save_filepath.is_none() {
                    return Err(Error::InvalidValue {
                        key: "save",
                        reason: "bias_correction stores monthly digests under save_filepath"
                            .to_string(),
                    });
                }
                let aggregation = match raw.bias_adjust_aggregation.as_deref() {
                    Some("sum") => Aggregation::Sum,
                    Some("mean") => Aggregation::Mean,
                    Some(other) => {
                        return Err(Error::InvalidValue {
                            key: "bias_adjust_aggregation",
                            reason: format!("'{other}' is neither 'sum' nor 'mean'"),
                        });
                    }
                    None if PRECIPITATION_VARIABLES.contains(&variable.as_str()) => {
                        Aggregation::Sum
                    }
                    None => Aggregation::Mean,
                };
                Statistic::BiasCorrection { aggregation }
            }
            other => return Err(Error::UnknownStatistic(other.to_string())),
        };

        if is_raw && stat_freq == Cadence::Continuous {
            return Err(Error::InvalidPairing {
                window: stat_freq,
                output: output_freq,
            });
        }

        let compression = match raw.compression {
            Some(c) if c > 0.0 && c.is_finite() => c,
            Some(c) => {
                return Err(Error::InvalidValue {
                    key: "compression",
                    reason: format!("{c} is not a positive number"),
                });
            }
            None => {
                if statistic.uses_digests() {
                    warn!(
                        compression = DEFAULT_COMPRESSION,
                        "No digest compression given, using default"
                    );
                }
                DEFAULT_COMPRESSION
            }
        };

        Ok(Self {
            statistic,
            stat_freq,
            output_freq,
            time_step,
            variable,
            save_filepath,
            checkpoint_filepath,
            compression,
        })
    }
}

fn required_path(
    enabled: bool,
    path: Option<PathBuf>,
    key: &'static str,
) -> Result<Option<PathBuf>, Error> {
    match (enabled, path) {
        (true, Some(path)) => Ok(Some(path)),
        (true, None) => Err(Error::MissingKey(key)),
        (false, _) => Ok(None),
    }
}

/// `0.00, 0.01, ..., 0.99`
fn full_distribution() -> Vec<f64> {
    (0..100).map(|i| f64::from(i) / 100.0).collect()
}

fn quantiles(list: Option<PercentileList>) -> Result<Vec<f64>, Error> {
    match list {
        None => {
            warn!("No percentile_list given, computing the full distribution");
            Ok(full_distribution())
        }
        Some(PercentileList::Keyword(word)) if word == "all" => Ok(full_distribution()),
        Some(PercentileList::Keywords(words)) if words.len() == 1 && words[0] == "all" => {
            Ok(full_distribution())
        }
        Some(PercentileList::Keyword(word)) => Err(Error::InvalidValue {
            key: "percentile_list",
            reason: format!("'{word}' is not 'all'"),
        }),
        Some(PercentileList::Keywords(words)) => Err(Error::InvalidValue {
            key: "percentile_list",
            reason: format!("{words:?} is not [\"all\"]"),
        }),
        Some(PercentileList::Values(values)) => {
            if values.is_empty() {
                return Err(Error::InvalidValue {
                    key: "percentile_list",
                    reason: "at least one percentile is required".to_string(),
                });
            }
            if let Some(bad) = values.iter().find(|q| !(0.0..=1.0).contains(*q)) {
                return Err(Error::InvalidValue {
                    key: "percentile_list",
                    reason: format!("{bad} is outside [0, 1]"),
                });
            }
            Ok(values)
        }
    }
}

#[cfg(test)]
pub(crate) fn raw(stat: &str, stat_freq: &str, output_freq: &str, time_step: u64) -> RawRequest {
    RawRequest {
        stat: Some(stat.to_string()),
        stat_freq: Some(stat_freq.to_string()),
        output_freq: Some(output_freq.to_string()),
        time_step: Some(time_step),
        variable: Some("tas".to_string()),
        save: Some(false),
        checkpoint: Some(false),
        compression: Some(1.0),
        ..RawRequest::default()
    }
}
