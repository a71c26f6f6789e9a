//! One-pass statistics over time-stamped gridded streams
//!
//! Samples arrive in time-ordered batches. Each statistic is computed over
//! calendar windows (`stat_freq`) without holding the window's samples:
//! an [`accumulator::Accumulator`] folds sub-batches into a running state and
//! is read out when the window is complete. Completed windows are
//! concatenated into output periods (`output_freq`) before they leave the
//! [`engine::Engine`]. State can be checkpointed after every batch so that a
//! restarted engine continues where it stopped.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

pub mod accumulator;
pub mod append;
pub mod bias_correction;
pub mod checkpoint;
pub mod clock;
pub mod digest;
pub mod engine;
pub mod frame;
pub mod output;
pub mod request;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test;

pub use engine::{Engine, Error};
pub use frame::{Batch, Frame};
pub use output::{Output, OutputKind};
pub use request::{RawRequest, Request, Statistic};
