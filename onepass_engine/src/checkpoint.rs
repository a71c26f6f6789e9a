//! Snapshot and restore of engine state
//!
//! A checkpoint is a postcard blob holding the request, the window and append
//! counters, and the heavy payload: the accumulator and the buffered output
//! period. When the payload is estimated above a ceiling the checkpoint is
//! written in bulk: the blob keeps only the light fields and each heavy field
//! goes to its own zstd-compressed slot next to it. Every file is written to
//! a temporary path and renamed into place, so a crash mid-write leaves the
//! previous checkpoint readable.
//!
//! All files of one checkpoint share the prefix
//! `checkpoint_{variable}_{stat_freq}_{output_freq}_timestep_{time_step}`.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::{
    accumulator::Accumulator,
    append::AppendState,
    output::Readout,
    request::Request,
    tracker::WindowState,
};

/// Estimated heavy payload, in bytes, above which checkpoints are written in
/// bulk.
pub const DEFAULT_CEILING: u64 = 1_600_000_000;

const ZSTD_LEVEL: i32 = 3;
const ACCUMULATOR_SLOT: &str = "accumulator";
const APPEND_SLOT: &str = "append";

/// Errors produced by checkpoint I/O
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading or writing a checkpoint file failed
    #[error("Checkpoint I/O on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// State could not be serialized
    #[error("Failed to encode checkpoint {path}: {source}")]
    Encode {
        /// File being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: postcard::Error,
    },
    /// A checkpoint file could not be deserialized
    #[error("Failed to decode checkpoint {path}: {source}")]
    Decode {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: postcard::Error,
    },
    /// The checkpoint was written for a different request
    #[error("Checkpoint {path} was written for a different request")]
    IncompatibleCheckpoint {
        /// Checkpoint blob
        path: PathBuf,
    },
    /// A bulk checkpoint's slot is missing
    #[error("Checkpoint slot {path} is missing")]
    MissingSlot {
        /// Expected slot
        path: PathBuf,
    },
    /// The checkpoint records an open window or output period without the
    /// state that backs it
    #[error("Checkpoint {path} is missing the {field} of its open window")]
    IncompleteCheckpoint {
        /// Checkpoint blob
        path: PathBuf,
        /// Absent field
        field: &'static str,
    },
}

/// Engine state as written, borrowed from the live engine
#[derive(Debug, Serialize)]
pub struct SnapshotRef<'a> {
    /// Request the state belongs to
    pub request: &'a Request,
    /// Grid shape, once established
    pub dims: Option<&'a [usize]>,
    /// Window counters
    pub window: &'a WindowState,
    /// Output period counters
    pub append: Option<&'a AppendState>,
    /// Running statistic of the open window
    pub accumulator: Option<&'a Accumulator>,
    /// Buffered readouts of the open output period
    pub buffer: Option<&'a Readout>,
}

/// Engine state as read back
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Snapshot {
    /// Request the state belongs to
    pub request: Request,
    /// Grid shape, once established
    pub dims: Option<Vec<usize>>,
    /// Window counters
    pub window: WindowState,
    /// Output period counters
    pub append: Option<AppendState>,
    /// Running statistic of the open window
    pub accumulator: Option<Accumulator>,
    /// Buffered readouts of the open output period
    pub buffer: Option<Readout>,
}

/// Reads, writes and removes the checkpoint of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointManager {
    dir: PathBuf,
    prefix: String,
    stat: &'static str,
    ceiling: u64,
}

impl CheckpointManager {
    /// Manager for `request`'s checkpoint under `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, request: &Request) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!(
                "checkpoint_{}_{}_{}_timestep_{}",
                request.variable, request.stat_freq, request.output_freq, request.time_step
            ),
            stat: request.statistic.name(),
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Replace the bulk ceiling
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Whether a payload of `bytes` is written in bulk
    #[must_use]
    pub fn is_bulk(&self, bytes: u64) -> bool {
        bytes > self.ceiling
    }

    /// Path of the checkpoint blob
    #[must_use]
    pub fn blob_path(&self) -> PathBuf {
        self.dir.join(format!("{}_{}.bin", self.prefix, self.stat))
    }

    fn slot_path(&self, field: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{field}.zst", self.prefix, self.stat))
    }

    /// Write `snapshot`, in bulk when `snapshot.window.bulk` is set. Returns
    /// the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any file operation fails.
    pub fn save(&self, snapshot: &SnapshotRef<'_>) -> Result<u64, Error> {
        fs::create_dir_all(&self.dir).map_err(|source| Error::Io {
            path: self.dir.clone(),
            source,
        })?;

        let written = if snapshot.window.bulk {
            let light = SnapshotRef {
                accumulator: None,
                buffer: None,
                ..*snapshot
            };
            let slots = write_slot(&self.slot_path(ACCUMULATOR_SLOT), &snapshot.accumulator)?
                + write_slot(&self.slot_path(APPEND_SLOT), &snapshot.buffer)?;
            slots + write_blob(&self.blob_path(), &light)?
        } else {
            let written = write_blob(&self.blob_path(), snapshot)?;
            remove_file(&self.slot_path(ACCUMULATOR_SLOT))?;
            remove_file(&self.slot_path(APPEND_SLOT))?;
            written
        };

        counter!("checkpoint_bytes_written").increment(written);
        debug!(
            path = %self.blob_path().display(),
            bytes = written,
            bulk = snapshot.window.bulk,
            "Checkpoint written"
        );
        Ok(written)
    }

    /// Read the checkpoint, if one exists, and check it belongs to `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or decoded, or the
    /// checkpoint was written for another request.
    pub fn load(&self, request: &Request) -> Result<Option<Snapshot>, Error> {
        let path = self.blob_path();
        let Some(mut snapshot) = read_blob::<Snapshot>(&path)? else {
            return Ok(None);
        };
        if snapshot.request != *request {
            return Err(Error::IncompatibleCheckpoint { path });
        }
        if snapshot.window.bulk {
            snapshot.accumulator = read_required_slot(&self.slot_path(ACCUMULATOR_SLOT))?;
            snapshot.buffer = read_required_slot(&self.slot_path(APPEND_SLOT))?;
        }

        let accumulating = snapshot.window.start.is_some()
            || (request.is_continuous() && snapshot.window.lifetime_count > 0);
        if accumulating && snapshot.accumulator.is_none() {
            return Err(Error::IncompleteCheckpoint {
                path,
                field: ACCUMULATOR_SLOT,
            });
        }
        let appended = snapshot.append.as_ref().is_some_and(|a| a.count_append > 0);
        if appended && snapshot.buffer.is_none() {
            return Err(Error::IncompleteCheckpoint {
                path,
                field: APPEND_SLOT,
            });
        }
        info!(
            path = %path.display(),
            count = snapshot.window.count,
            n_data = snapshot.window.n_data,
            "Restored checkpoint"
        );
        Ok(Some(snapshot))
    }

    /// Delete the blob and every bulk slot. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn remove(&self) -> Result<(), Error> {
        remove_file(&self.blob_path())?;
        remove_file(&self.slot_path(ACCUMULATOR_SLOT))?;
        remove_file(&self.slot_path(APPEND_SLOT))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<u64, Error> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|source| Error::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(bytes.len() as u64)
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write `value` as a postcard blob
pub(crate) fn write_blob<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<u64, Error> {
    let bytes = postcard::to_stdvec(value).map_err(|source| Error::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Read a postcard blob, `None` if the file does not exist
pub(crate) fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    let Some(bytes) = read_file(path)? else {
        return Ok(None);
    };
    postcard::from_bytes(&bytes)
        .map(Some)
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn read_required_slot<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    read_slot(path)?.ok_or_else(|| Error::MissingSlot {
        path: path.to_path_buf(),
    })
}

/// Write `value` as a zstd-compressed postcard slot
pub(crate) fn write_slot<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<u64, Error> {
    let bytes = postcard::to_stdvec(value).map_err(|source| Error::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let compressed = zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &compressed)
}

/// Read a zstd-compressed postcard slot, `None` if the file does not exist
pub(crate) fn read_slot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    let Some(compressed) = read_file(path)? else {
        return Ok(None);
    };
    let bytes = zstd::decode_all(compressed.as_slice()).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    postcard::from_bytes(&bytes)
        .map(Some)
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })
}
