//! Explicit configuration for both relay roles.
//!
//! Every component receives its configuration at construction; there is no
//! process-wide state. All structs implement [`Default`] with the values the
//! relay ships with, and deserialize from JSON so a deployment can keep them in
//! a file:
//!
//! ```no_run
//! use rowrelay::config::RelayConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = RelayConfig::from_json_file("relay.json")?;
//! assert!(config.batch_size > 0);
//! # Ok(())
//! # }
//! ```
//!
//! Missing keys fall back to their defaults, so `{}` is a valid config file.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bounded wait and bounded local re-queue settings for the reassembler.
///
/// The policy is fixed-interval: a fragment whose predecessor has not been
/// materialized yet is usually waiting on a sibling in the same batch, so
/// backing off exponentially would only slow that sibling down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How many times a single pass polls for the pending token.
    pub max_file_lookups: u32,
    /// Sleep between two polls, in milliseconds.
    pub lookup_interval_ms: u64,
    /// How many times one `(task_id, line_number)` may be re-queued locally
    /// before its task is quarantined.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_file_lookups: 20,
            lookup_interval_ms: 100,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// The poll interval as a [`Duration`].
    #[must_use]
    pub const fn lookup_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_interval_ms)
    }

    /// A policy that never sleeps and gives up quickly. Handy in tests.
    #[must_use]
    pub const fn immediate(max_file_lookups: u32, max_retries: u32) -> Self {
        Self {
            max_file_lookups,
            lookup_interval_ms: 0,
            max_retries,
        }
    }
}

/// Reassembler (consumer role) configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfig {
    /// Directory that holds targets, pending tokens and quarantine markers.
    pub work_dir: PathBuf,
    /// Prefix of every file the reassembler creates.
    pub output_prefix: String,
    /// Field delimiter used when encoding rows.
    pub delimiter: u8,
    /// Row terminator appended after every non-final row.
    pub terminator: String,
    /// Stall handling.
    pub retry: RetryPolicy,
    /// Process fragments of different tasks on a rayon pool.
    pub parallel_tasks: bool,
    /// Size of that pool; defaults to the number of CPUs.
    pub worker_threads: Option<usize>,
    /// `fsync` each pending file before handing its token on.
    pub sync_writes: bool,
    /// Emit one event per fragment at `debug` instead of `trace`.
    pub debug: bool,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            output_prefix: "output_".to_string(),
            delimiter: b',',
            terminator: "\n".to_string(),
            retry: RetryPolicy::default(),
            parallel_tasks: true,
            worker_threads: None,
            sync_writes: false,
            debug: false,
        }
    }
}

impl ReassemblerConfig {
    /// Default configuration rooted at `work_dir`.
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }
}

/// Sequencer (producer role) configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Field delimiter of the source file.
    pub delimiter: u8,
    /// Skip rows the duplicate filter believes were already published.
    ///
    /// Off by default: a false positive silently drops a row.
    pub use_duplicate_filter: bool,
    /// Upper bound on the filter's expected item count.
    pub filter_max_items: u64,
    /// Lower bound on the filter's expected item count. Keeps a small file's
    /// filter sparse enough that its own rows do not collide.
    pub filter_min_items: u64,
    /// Typical encoded row size, used to estimate the row count from the file
    /// size without scanning the file.
    pub typical_row_size_bytes: u64,
    /// Target false-positive probability of the filter.
    pub false_positive_probability: f64,
    /// Number of hash functions per item.
    pub hash_count: u32,
    /// Where filter snapshots survive between runs. `None` keeps the filter in
    /// memory only.
    pub filter_snapshot_dir: Option<PathBuf>,
    /// Save the snapshot after this many published fragments, in addition to
    /// the save when publishing stops. `0` saves only when publishing stops.
    pub filter_snapshot_every: u64,
    /// Emit one event per fragment at `debug` instead of `trace`.
    pub debug: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            use_duplicate_filter: false,
            filter_max_items: 10_000,
            filter_min_items: 1_000,
            // 100 two-byte UTF-8 characters.
            typical_row_size_bytes: 200,
            false_positive_probability: 0.02,
            hash_count: 3,
            filter_snapshot_dir: None,
            filter_snapshot_every: 1_000,
            debug: false,
        }
    }
}

/// Configuration for a whole deployment: both roles plus the bus batch size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub sequencer: SequencerConfig,
    pub reassembler: ReassemblerConfig,
    /// Messages fetched per delivery.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sequencer: SequencerConfig::default(),
            reassembler: ReassemblerConfig::default(),
            batch_size: 10,
        }
    }
}

impl RelayConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or holds
    /// values the relay cannot run with.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the relay misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.reassembler.delimiter != b'\n' && self.reassembler.delimiter != b'\r',
            "reassembler delimiter cannot be a line break"
        );
        ensure!(
            !self.reassembler.terminator.is_empty(),
            "reassembler terminator cannot be empty"
        );
        let p = self.sequencer.false_positive_probability;
        ensure!(
            p > 0.0 && p < 1.0,
            "false_positive_probability must be in (0, 1), got {p}"
        );
        ensure!(self.sequencer.hash_count > 0, "hash_count must be positive");
        ensure!(
            self.sequencer.typical_row_size_bytes > 0,
            "typical_row_size_bytes must be positive"
        );
        ensure!(
            self.sequencer.filter_min_items <= self.sequencer.filter_max_items,
            "filter_min_items must not exceed filter_max_items"
        );
        Ok(())
    }
}
