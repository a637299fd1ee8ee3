//! # Rowrelay
//!
//! Move delimited text files row by row across an **unordered, at-least-once
//! message bus** and rebuild them byte-exactly on the other side, with no
//! coordinator and no shared database. The receiving filesystem is the only
//! shared state.
//!
//! ## Key Features
//!
//! - **Order recovery** - fragments may arrive in any order and any number of
//!   times; the target file is still written in source order, once
//! - **Filesystem as mutex** - a pending file named after the next expected
//!   row number is the single token that admits a fragment
//! - **Bounded stalls** - fragments whose predecessor never shows up are
//!   retried a bounded number of times, then their task is quarantined with
//!   its partial output preserved
//! - **Terminal tasks stay terminal** - redeliveries after completion or
//!   quarantine are acknowledged and dropped
//! - **Optional duplicate suppression** - a bloom filter can skip rows the
//!   producer has already published, with snapshots surviving restarts
//! - **Pluggable transport** - anything implementing the traits in [`bus`];
//!   an in-process [`MemoryBus`] ships for tests and demos
//!
//! ## Quick Start
//!
//! ```no_run
//! use rowrelay::*;
//! use std::sync::atomic::AtomicBool;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let bus = MemoryBus::default();
//!
//! // Producer side: one fragment per row, plus the end-of-file marker.
//! let report = Sequencer::default().publish_file("data.csv", &bus)?;
//!
//! // Consumer side: rebuild the file in the working directory.
//! let reassembler = Reassembler::new(ReassemblerConfig::in_dir("out"))?;
//! let options = ConsumeOptions { stop_when_idle: true, ..Default::default() };
//! reassembler.consume(&mut bus.subscriber(), options, &AtomicBool::new(false))?;
//!
//! assert!(reassembler.paths(&report.task).is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## File layout
//!
//! For a task with id `T` relaying `data.csv`, every file lives in the
//! reassembler's working directory under the base name `output_T.data.csv`:
//!
//! | File                  | Meaning                                     |
//! |-----------------------|---------------------------------------------|
//! | `<base>`              | complete output                             |
//! | `<base>.<n>`          | rows `0..n` written, fragment `n` is next   |
//! | `<base>.failed`       | task quarantined; holds the longest partial |
//! | `<base>.<n>.failed`   | other partials preserved by the quarantine  |
//!
//! See [`layout`] for the state machine and [`reassembler`] for the protocol.
//!
//! ## Module Overview
//!
//! - [`sequencer`] - producer role: split a file into numbered fragments
//! - [`reassembler`] - consumer role: turn fragments back into files
//! - [`fragment`] - message payload, headers and row encoding
//! - [`layout`] - file naming and task state on disk
//! - [`retry`] - bounded waiting and re-queueing
//! - [`filter`] - duplicate-row bloom filter
//! - [`bus`] - transport traits and the in-memory bus
//! - [`config`] - configuration for both roles
//! - [`metrics`] - counters shared by both roles
//! - [`testing`] - fixtures and assertions for relay tests

pub mod bus;
pub mod config;
pub mod filter;
pub mod fragment;
pub mod layout;
pub mod metrics;
pub mod reassembler;
pub mod retry;
pub mod sequencer;
pub mod testing;

pub use bus::{BusError, Delivery, MemoryBus, MemoryBusOptions, OutboundMessage, Publisher, Subscriber};
pub use config::{ReassemblerConfig, RelayConfig, RetryPolicy, SequencerConfig};
pub use filter::DuplicateFilter;
pub use fragment::{Fragment, FragmentError, FragmentKey, TaskRef};
pub use layout::{TaskPaths, TaskState};
pub use metrics::MetricsCollector;
pub use reassembler::{BatchReport, ConsumeOptions, FragmentOutcome, Reassembler};
pub use sequencer::{PublishReport, Sequencer, SequencerError, generate_task_id};
