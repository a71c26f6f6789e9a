//! JSONL batches in, JSONL outputs out
//!
//! Each input line is one batch, `{"times": [...], "dims": [...], "values":
//! [...]}`, with values time-major. Each output line is one serialized
//! [`Output`]. Blank input lines are skipped.

use std::io::{BufRead, Write};

use chrono::NaiveDateTime;
use onepass_engine::{Batch, Output, frame};
use serde::Deserialize;

/// JSONL errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO errors during read or write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A line is not a batch
    #[error("Line {line} is not a valid batch: {source}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A line's values do not match its times and dims
    #[error("Line {line} is not a valid batch: {source}")]
    Shape {
        /// 1-based line number
        line: usize,
        /// Underlying error
        #[source]
        source: frame::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchLine {
    times: Vec<NaiveDateTime>,
    dims: Vec<usize>,
    values: Vec<f64>,
}

/// Reads one batch per line
#[derive(Debug)]
pub struct Reader<R: BufRead> {
    reader: R,
    line: usize,
    buffer: String,
}

impl<R: BufRead> Reader<R> {
    /// Create a new instance of `Reader`
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buffer: String::new(),
        }
    }

    fn read_batch(&mut self) -> Result<Option<Batch>, Error> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let trimmed = self.buffer.trim();
            if trimmed.is_empty() {
                continue;
            }

            let line = self.line;
            let parsed: BatchLine =
                serde_json::from_str(trimmed).map_err(|source| Error::Parse { line, source })?;
            let batch = Batch::new(parsed.times, parsed.dims, parsed.values)
                .map_err(|source| Error::Shape { line, source })?;
            return Ok(Some(batch));
        }
    }
}

impl<R: BufRead> Iterator for Reader<R> {
    type Item = Result<Batch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_batch().transpose()
    }
}

/// JSONL output writer
#[derive(Debug)]
pub struct Format<W: Write> {
    writer: W,
}

impl<W: Write> Format<W> {
    /// Create a new instance of `Format`
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single output line
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn write_output(&mut self, output: &Output) -> Result<(), Error> {
        let payload = serde_json::to_string(output)?;
        self.writer.write_all(payload.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Flush any buffered data
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}
