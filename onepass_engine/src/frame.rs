//! Time-major dense arrays
//!
//! A [`Frame`] holds one slice of `cells()` values per timestamp, stored
//! contiguously in time order. Incoming data is a [`Batch`], a frame of f64.
//! Outputs use the same layout, with a leading axis folded into `dims` when a
//! statistic produces more than one value per cell (thresholds, quantiles,
//! histogram bins, durations).

use std::ops::Range;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Errors produced by [`Frame`] construction and concatenation
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The data length is not `times × product(dims)`
    #[error("Frame holds {found} values, expected {expected} for {times} timestamps over dims {dims:?}")]
    Length {
        /// Values supplied
        found: usize,
        /// Values implied by times and dims
        expected: usize,
        /// Number of timestamps
        times: usize,
        /// Spatial dimensions
        dims: Vec<usize>,
    },
    /// Two frames disagree on their spatial dimensions
    #[error("Shape mismatch: expected dims {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Dimensions already established
        expected: Vec<usize>,
        /// Dimensions offered
        found: Vec<usize>,
    },
}

/// Gridded values over an ordered time axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    /// One timestamp per time slice
    pub times: Vec<NaiveDateTime>,
    /// Shape of one time slice
    pub dims: Vec<usize>,
    /// Time-major values, `times.len() × product(dims)` long
    pub data: Vec<T>,
}

/// A chunk of input samples
pub type Batch = Frame<f64>;

impl<T: Clone> Frame<T> {
    /// Create a new frame, validating the data length
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not `times × product(dims)` long.
    pub fn new(times: Vec<NaiveDateTime>, dims: Vec<usize>, data: Vec<T>) -> Result<Self, Error> {
        let frame = Self { times, dims, data };
        frame.validate()?;
        Ok(frame)
    }

    /// Check that the data length is `times × product(dims)`
    ///
    /// # Errors
    ///
    /// Returns an error if it is not.
    pub fn validate(&self) -> Result<(), Error> {
        let expected = self.len() * self.cells();
        if self.data.len() != expected {
            return Err(Error::Length {
                found: self.data.len(),
                expected,
                times: self.len(),
                dims: self.dims.clone(),
            });
        }
        Ok(())
    }

    /// Number of values per time slice
    #[must_use]
    pub fn cells(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of time slices
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether the frame has no time slices
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Values of time slice `index`
    #[must_use]
    pub fn row(&self, index: usize) -> &[T] {
        let cells = self.cells();
        &self.data[index * cells..(index + 1) * cells]
    }

    /// Iterate over time slices
    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        let cells = self.cells().max(1);
        self.data.chunks(cells)
    }

    /// Copy out the time slices in `range`
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        let cells = self.cells();
        Self {
            times: self.times[range.clone()].to_vec(),
            dims: self.dims.clone(),
            data: self.data[range.start * cells..range.end * cells].to_vec(),
        }
    }

    /// Append `other` along the time axis
    ///
    /// # Errors
    ///
    /// Returns an error if the spatial dimensions differ.
    pub fn concat(&mut self, other: Frame<T>) -> Result<(), Error> {
        if self.dims != other.dims {
            return Err(Error::ShapeMismatch {
                expected: self.dims.clone(),
                found: other.dims,
            });
        }
        self.times.extend(other.times);
        self.data.extend(other.data);
        Ok(())
    }

    /// Keep only the first `len` time slices
    pub fn truncate(&mut self, len: usize) {
        let cells = self.cells();
        self.times.truncate(len);
        self.data.truncate(len * cells);
    }
}
