//! Command-line driver for the one-pass statistics engine
//!
//! Reads a request from YAML, feeds JSON-lines batches through an
//! [`onepass_engine::Engine`] and writes every completed output as a JSON
//! line.

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

pub mod config;
pub mod jsonl;
