//! Test helpers for code built on the relay.
//!
//! - **Fixtures**: source files with known content, including the awkward
//!   cases (quoted line breaks, no trailing newline).
//! - **Mock I/O**: a throwaway source and working directory pair.
//! - **Assertions**: check a task's files once a run is over.
//! - [`RecordingPublisher`]: a publisher that only remembers what it was given,
//!   so fragments can be replayed in any order.
//!
//! # Quick Start
//!
//! ```no_run
//! use rowrelay::testing::*;
//! use rowrelay::{Reassembler, ReassemblerConfig, Sequencer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let dirs = RelayDirs::new()?;
//! let source = dirs.write_source("data.csv", TWO_ROWS_TRAILING_NEWLINE)?;
//!
//! let publisher = RecordingPublisher::new();
//! let report = Sequencer::default().publish_file(&source, &publisher)?;
//!
//! let reassembler = Reassembler::new(ReassemblerConfig::in_dir(dirs.work_dir()))?;
//! let mut fragments = publisher.fragments()?;
//! fragments.reverse();
//! reassembler.apply_fragments(fragments);
//!
//! assert_target_eq(&reassembler.paths(&report.task), TWO_ROWS_TRAILING_NEWLINE);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod mock_io;

pub use assertions::*;
pub use fixtures::*;
pub use mock_io::*;

use crate::bus::memory::SplitMix64;
use crate::bus::{BusError, OutboundMessage, Publisher};
use crate::fragment::{Fragment, TaskRef, decode};
use anyhow::Result;
use std::sync::{Arc, Mutex};

/// Publisher that keeps every message in memory, in publish order.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    closed: Arc<Mutex<u32>>,
    accept_limit: Option<usize>,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher that accepts `limit` messages, then reports a lost
    /// connection for every further one.
    #[must_use]
    pub fn disconnecting_after(limit: usize) -> Self {
        Self {
            accept_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Everything published so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// How many times [`Publisher::close`] was called.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn close_count(&self) -> u32 {
        *self.closed.lock().unwrap()
    }

    /// Decode every recorded message back into its task and fragment.
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded message does not decode.
    pub fn fragments(&self) -> Result<Vec<(TaskRef, Fragment)>> {
        self.messages()
            .iter()
            .map(|m| decode(&m.payload, &m.headers).map_err(anyhow::Error::from))
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        let mut messages = self.messages.lock().unwrap();
        if self.accept_limit.is_some_and(|limit| messages.len() >= limit) {
            return Err(BusError::Disconnected("recording publisher limit reached".into()));
        }
        messages.push(message);
        Ok(())
    }

    fn close(&self) -> Result<(), BusError> {
        *self.closed.lock().unwrap() += 1;
        Ok(())
    }
}

/// Deterministically shuffled copy of `items`.
///
/// # Example
///
/// ```
/// use rowrelay::testing::shuffled;
///
/// let a = shuffled(&[1, 2, 3, 4, 5], 7);
/// assert_eq!(a, shuffled(&[1, 2, 3, 4, 5], 7));
/// let mut sorted = a.clone();
/// sorted.sort_unstable();
/// assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
/// ```
#[must_use]
pub fn shuffled<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
    let mut out = items.to_vec();
    SplitMix64::new(seed).shuffle(&mut out);
    out
}

/// `items` with every `every`-th element repeated, then shuffled.
///
/// Models an at-least-once bus that both reorders and redelivers.
#[must_use]
pub fn with_redeliveries<T: Clone>(items: &[T], every: usize, seed: u64) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len() + items.len() / every.max(1));
    for (i, item) in items.iter().enumerate() {
        out.push(item.clone());
        if every > 0 && (i + 1) % every == 0 {
            out.push(item.clone());
        }
    }
    SplitMix64::new(seed).shuffle(&mut out);
    out
}

/// Every permutation of `items`. Only sensible for a handful of elements.
#[must_use]
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutations_cover_every_order() {
        let all = permutations(&[1, 2, 3]);
        assert_eq!(all.len(), 6);
        assert!(all.contains(&vec![3, 1, 2]));
    }

    #[test]
    fn redeliveries_add_copies() {
        let out = with_redeliveries(&[1, 2, 3, 4], 2, 1);
        assert_eq!(out.len(), 6);
        assert_eq!(out.iter().filter(|&&x| x == 2).count(), 2);
        assert_eq!(out.iter().filter(|&&x| x == 1).count(), 1);
    }
}
