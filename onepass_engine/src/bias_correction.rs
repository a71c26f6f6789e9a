//! Monthly reference distributions of daily aggregates
//!
//! Bias correction compares a model's daily values against a reference
//! distribution per calendar month. For every completed day the rotator loads
//! the [`DigestStore`] of that day's month from the save directory, creating
//! it when absent, folds the daily aggregate in and writes it back. Stores
//! are written compact (`.bin`, postcard) or, above the size ceiling, in bulk
//! (`.zst`, zstd-compressed postcard). Nothing is cached between days.

use std::path::{Path, PathBuf};

use chrono::Datelike;
use tracing::debug;

use crate::{
    checkpoint::{self, DEFAULT_CEILING, read_blob, read_slot, write_blob, write_slot},
    digest::DigestStore,
    frame::{self, Frame},
    request::Request,
};

/// Errors produced by [`BiasCorrectionDigestRotator`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A monthly store could not be read or written
    #[error(transparent)]
    Store(#[from] checkpoint::Error),
    /// The stored digests cover a different grid
    #[error(transparent)]
    Shape(#[from] frame::Error),
}

/// Loads, updates and saves the monthly digest stores
#[derive(Debug, Clone, PartialEq)]
pub struct BiasCorrectionDigestRotator {
    dir: PathBuf,
    variable: String,
    compression: f64,
    ceiling: u64,
}

impl BiasCorrectionDigestRotator {
    /// Rotator storing `request`'s monthly digests under `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, request: &Request) -> Self {
        Self {
            dir: dir.into(),
            variable: request.variable.clone(),
            compression: request.compression,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Replace the bulk ceiling
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Path of the store for `month` (1-based)
    #[must_use]
    pub fn month_path(&self, month: u32, bulk: bool) -> PathBuf {
        let extension = if bulk { "zst" } else { "bin" };
        self.dir.join(format!(
            "month_{month:02}_{}_bias_correction.{extension}",
            self.variable
        ))
    }

    /// Load the store for `month`, or an empty one over `cells` cells.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing store cannot be read.
    pub fn load(&self, month: u32, cells: usize) -> Result<DigestStore, Error> {
        if let Some(store) = read_blob::<DigestStore>(&self.month_path(month, false))? {
            return Ok(store);
        }
        if let Some(store) = read_slot::<DigestStore>(&self.month_path(month, true))? {
            return Ok(store);
        }
        Ok(DigestStore::new(cells, self.compression))
    }

    /// Fold each slice of `daily` into the store of its month.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be read or written, or covers a
    /// different grid than `daily`.
    pub fn update(&self, daily: &Frame<f64>) -> Result<(), Error> {
        for index in 0..daily.len() {
            let day = daily.slice(index..index + 1);
            let month = day.times[0].month();
            let mut store = self.load(month, day.cells())?;
            if store.cells() != day.cells() {
                return Err(frame::Error::ShapeMismatch {
                    expected: vec![store.cells()],
                    found: day.dims.clone(),
                }
                .into());
            }
            store.update(&day);
            self.save(month, &store)?;
            debug!(month, day = %day.times[0], "Daily aggregate folded into monthly digests");
        }
        Ok(())
    }

    fn save(&self, month: u32, store: &DigestStore) -> Result<(), Error> {
        let bulk = store.estimated_bytes() > self.ceiling;
        let (path, stale) = (self.month_path(month, bulk), self.month_path(month, !bulk));
        if bulk {
            write_slot(&path, store)?;
        } else {
            write_blob(&path, store)?;
        }
        remove_stale(&stale)
    }
}

fn remove_stale(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(checkpoint::Error::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}
