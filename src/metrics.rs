//! Counters for both relay roles.
//!
//! A [`MetricsCollector`] is cheap to clone and shared between the sequencer,
//! the reassembler and their worker threads. Built-in counters are named by the
//! constants in this module; custom metrics can be registered through the
//! [`Metric`] trait.
//!
//! ```
//! use rowrelay::metrics::{MetricsCollector, FRAGMENTS_WRITTEN};
//!
//! let metrics = MetricsCollector::new();
//! metrics.increment_counter(FRAGMENTS_WRITTEN, 2);
//! assert_eq!(metrics.counter(FRAGMENTS_WRITTEN), 2);
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fragments published by the sequencer.
pub const FRAGMENTS_PUBLISHED: &str = "fragments_published";
/// Rows the duplicate filter kept from being published.
pub const ROWS_SUPPRESSED: &str = "rows_suppressed";
/// Fragments appended to a pending file.
pub const FRAGMENTS_WRITTEN: &str = "fragments_written";
/// Tasks whose target file was produced.
pub const TASKS_COMPLETED: &str = "tasks_completed";
/// Fragments dropped because their task was already terminal.
pub const FRAGMENTS_DROPPED: &str = "fragments_dropped";
/// Messages that did not decode.
pub const FRAGMENTS_MALFORMED: &str = "fragments_malformed";
/// Local re-queues of fragments waiting for a predecessor.
pub const FRAGMENTS_REQUEUED: &str = "fragments_requeued";
/// Tasks that ran out of retries.
pub const TASKS_QUARANTINED: &str = "tasks_quarantined";
/// Fragments whose write or rename failed; left for redelivery.
pub const FRAGMENTS_FAILED: &str = "fragments_failed";

/// A custom metric.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }
}

/// Thread-safe metric registry.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsInner>>,
}

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<String, u64>,
    custom: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom metric, replacing one with the same name.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    pub fn register(&self, metric: Box<dyn Metric>) {
        let mut inner = self.inner.lock().unwrap();
        inner.custom.insert(metric.name().to_string(), metric);
    }

    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    pub fn record_start(&self) {
        self.inner.lock().unwrap().start_time = Some(Instant::now());
    }

    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    pub fn record_end(&self) {
        self.inner.lock().unwrap().end_time = Some(Instant::now());
    }

    /// Time between [`record_start`](Self::record_start) and
    /// [`record_end`](Self::record_end), if both were called.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to the counter `name`, creating it at zero if needed.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Current value of counter `name`; zero if it was never touched.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// All counters and custom metrics as one JSON object.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut out = serde_json::Map::new();
        for (name, count) in &inner.counters {
            out.insert(name.clone(), json!({ "value": count }));
        }
        for (name, metric) in &inner.custom {
            let mut obj = serde_json::Map::new();
            obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                obj.insert("description".to_string(), json!(desc));
            }
            out.insert(name.clone(), Value::Object(obj));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            out.insert(
                "execution_time_ms".to_string(),
                json!({ "value": end.duration_since(start).as_millis() }),
            );
        }
        drop(inner);
        Value::Object(out)
    }

    /// Print every metric to stdout, sorted by name.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    pub fn print(&self) {
        println!("\n============ Relay Metrics ============");
        let inner = self.inner.lock().unwrap();
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            let elapsed = end.duration_since(start);
            println!(
                "Execution Time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("---------------------------------------");
        }
        for (name, count) in &inner.counters {
            println!("{name}: {count}");
        }
        let mut custom: Vec<_> = inner.custom.iter().collect();
        custom.sort_by_key(|(name, _)| *name);
        for (name, metric) in custom {
            match metric.description() {
                Some(desc) => println!("{name}: {} ({desc})", metric.value()),
                None => println!("{name}: {}", metric.value()),
            }
        }
        drop(inner);
        println!("=======================================\n");
    }

    /// Write [`to_json`](Self::to_json) to `path`, pretty-printed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Counter values keyed by name.
    ///
    /// # Panics
    ///
    /// Panics if the collector's lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner.lock().unwrap().counters.clone()
    }
}

/// A fixed value reported alongside the counters.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}
