//! Consumer role: turn an unordered, at-least-once fragment stream back into
//! files.
//!
//! # Protocol
//!
//! For every fragment `n` of a task:
//!
//! 1. If the target exists the task is complete and the fragment is dropped.
//!    If the quarantine marker exists the task is failed and the fragment is
//!    dropped.
//! 2. Fragment 0 is always admitted and truncates any stale `pending(0)`.
//!    Any other fragment needs `pending(n)` to exist.
//! 3. While `pending(n)` is missing the fragment polls for it, then goes back
//!    onto the local work list; after too many trips the task is quarantined
//!    (see [`crate::retry`]).
//! 4. The row is appended to `pending(n)`, followed by the terminator unless
//!    the fragment is the last one.
//! 5. `pending(n)` is renamed to `pending(n + 1)`, or to the target on `eof`.
//! 6. The message is acknowledged after step 5, or when it is dropped for
//!    good. A fragment that is waiting, re-queued, or whose write failed is
//!    never acknowledged.
//!
//! # Known hazard
//!
//! Step 2 lets a late redelivery of fragment 0 restart a task that has
//! already moved past row 0. The restart writes a fresh `pending(1)` next to
//! the real token and the task can end up with row 0 twice, or stall and be
//! quarantined. This mirrors deployed behavior and is kept on purpose.
//!
//! Waiting only ever happens inside one batch. A fragment whose predecessor
//! has not arrived by the time its batch is processed stalls, is re-queued
//! within that batch until its retries run out, and then quarantines the
//! task, even if the predecessor is sitting in the very next batch. A
//! producer whose rows may reach the bus more than one batch out of order
//! needs a batch size large enough to span the reordering.
//!
//! # Concurrency
//!
//! A batch is split into one work list per task. Each list is processed
//! sequentially, because admission of fragment `n + 1` depends on the rename
//! done by fragment `n`. Lists of different tasks touch disjoint files and run
//! in parallel on a rayon pool (feature `parallel-tasks`).

use crate::bus::{BusError, Delivery, Subscriber, SubscriberGuard};
use crate::config::ReassemblerConfig;
use crate::fragment::{Fragment, FragmentError, FragmentKey, TaskRef, decode};
use crate::layout::{Quarantine, TaskPaths};
use crate::metrics::{
    FRAGMENTS_DROPPED, FRAGMENTS_FAILED, FRAGMENTS_MALFORMED, FRAGMENTS_REQUEUED,
    FRAGMENTS_WRITTEN, MetricsCollector, TASKS_COMPLETED, TASKS_QUARANTINED,
};
use crate::retry::{RetryTracker, StallDecision};
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[cfg(feature = "parallel-tasks")]
use rayon::prelude::*;
#[cfg(feature = "parallel-tasks")]
use std::sync::Arc;

/// Final result of processing one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Row appended and token moved to the next line number.
    Written { line_number: u64 },
    /// Final row appended; the target now exists.
    Completed { line_number: u64 },
    /// The task was already complete.
    DroppedComplete,
    /// The task was already quarantined.
    DroppedQuarantined,
    /// The message could not be decoded.
    Malformed(FragmentError),
    /// This fragment exhausted its retries and quarantined its task.
    Quarantined(Quarantine),
    /// Writing or renaming failed; left unacknowledged for redelivery.
    Failed(String),
}

impl FragmentOutcome {
    /// Whether the message is acknowledged to the bus.
    #[must_use]
    pub const fn acknowledges(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Tally of one or more batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: u64,
    pub written: u64,
    pub completed: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub quarantined: u64,
    pub failed: u64,
    /// Local re-queues; one message may be counted several times.
    pub requeued: u64,
    pub acked: u64,
    pub ack_errors: u64,
}

impl BatchReport {
    pub fn merge(&mut self, other: &Self) {
        self.received += other.received;
        self.written += other.written;
        self.completed += other.completed;
        self.dropped += other.dropped;
        self.malformed += other.malformed;
        self.quarantined += other.quarantined;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.acked += other.acked;
        self.ack_errors += other.ack_errors;
    }

    fn record(&mut self, outcome: &FragmentOutcome) {
        match outcome {
            FragmentOutcome::Written { .. } => self.written += 1,
            FragmentOutcome::Completed { .. } => {
                self.written += 1;
                self.completed += 1;
            }
            FragmentOutcome::DroppedComplete | FragmentOutcome::DroppedQuarantined => {
                self.dropped += 1;
            }
            FragmentOutcome::Malformed(_) => self.malformed += 1,
            FragmentOutcome::Quarantined(_) => self.quarantined += 1,
            FragmentOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// How [`Reassembler::consume`] fetches and when it stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Messages per fetch.
    pub batch_size: usize,
    /// Sleep after an empty fetch.
    pub idle_poll: Duration,
    /// Return after the first empty fetch instead of polling again.
    pub stop_when_idle: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_poll: Duration::from_secs(1),
            stop_when_idle: false,
        }
    }
}

enum Step {
    Done(FragmentOutcome),
    Requeue,
}

struct WorkItem {
    index: usize,
    fragment: Fragment,
    delivery: Option<Box<dyn Delivery>>,
}

/// Consumer role.
pub struct Reassembler {
    config: ReassemblerConfig,
    metrics: Option<MetricsCollector>,
    #[cfg(feature = "parallel-tasks")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Reassembler {
    /// Build a reassembler, creating its working directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory or worker pool cannot be
    /// created.
    pub fn new(config: ReassemblerConfig) -> Result<Self> {
        create_dir_all(&config.work_dir)
            .with_context(|| format!("mkdir -p {}", config.work_dir.display()))?;

        #[cfg(feature = "parallel-tasks")]
        let pool = if config.parallel_tasks {
            let threads = config.worker_threads.unwrap_or_else(num_cpus::get).max(1);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("reassembler-{i}"))
                .build()
                .context("build reassembler worker pool")?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            config,
            metrics: None,
            #[cfg(feature = "parallel-tasks")]
            pool,
        })
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// File names of `task` in this reassembler's working directory.
    #[must_use]
    pub fn paths(&self, task: &TaskRef) -> TaskPaths {
        TaskPaths::new(&self.config.work_dir, &self.config.output_prefix, task)
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, 1);
        }
    }

    fn append_row(&self, paths: &TaskPaths, fragment: &Fragment) -> Result<()> {
        let bytes = fragment.encode(self.config.delimiter, &self.config.terminator);
        let token = paths.pending(fragment.line_number);
        let mut options = OpenOptions::new();
        if fragment.line_number == 0 {
            options.write(true).create(true).truncate(true);
        } else {
            // No `create`: a token that vanished since admission is an error.
            options.append(true);
        }
        let mut file = options
            .open(&token)
            .with_context(|| format!("open {}", token.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("append to {}", token.display()))?;
        if self.config.sync_writes {
            file.sync_data()
                .with_context(|| format!("sync {}", token.display()))?;
        }
        drop(file);
        paths.advance(fragment.line_number, fragment.eof)?;
        Ok(())
    }

    fn step(
        &self,
        paths: &TaskPaths,
        task: &TaskRef,
        fragment: &Fragment,
        tracker: &mut RetryTracker,
    ) -> Step {
        let n = fragment.line_number;
        if paths.is_complete() {
            debug!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                "task already complete, dropping fragment");
            return Step::Done(FragmentOutcome::DroppedComplete);
        }
        if paths.is_quarantined() {
            debug!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                "task quarantined, dropping fragment");
            return Step::Done(FragmentOutcome::DroppedQuarantined);
        }

        let key = FragmentKey {
            task_id: task.task_id.clone(),
            line_number: n,
        };
        let token = paths.pending(n);
        if n == 0 {
            if token.exists() {
                info!(task_id = %task.task_id, filename = %task.filename,
                    "initial pending file already exists, overwriting");
            }
        } else if !tracker.wait_until(|| token.exists()) {
            return match tracker.on_stall(key) {
                StallDecision::Requeue { attempt } => {
                    warn!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                        attempt, "predecessor not ready, re-queueing locally");
                    Step::Requeue
                }
                StallDecision::Quarantine => match paths.quarantine() {
                    Ok(q) => {
                        warn!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                            preserved = q.renamed.len(), "retries exhausted, task quarantined");
                        Step::Done(FragmentOutcome::Quarantined(q))
                    }
                    Err(e) => {
                        error!(task_id = %task.task_id, filename = %task.filename,
                            line_number = n, error = %format!("{e:#}"), "quarantine failed");
                        Step::Done(FragmentOutcome::Failed(format!("{e:#}")))
                    }
                },
            };
        }

        if self.config.debug {
            debug!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                eof = fragment.eof, "writing fragment");
        } else {
            trace!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                eof = fragment.eof, "writing fragment");
        }
        match self.append_row(paths, fragment) {
            Ok(()) => {
                tracker.forget(&key);
                if fragment.eof {
                    info!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                        "last fragment received, file complete");
                    Step::Done(FragmentOutcome::Completed { line_number: n })
                } else {
                    Step::Done(FragmentOutcome::Written { line_number: n })
                }
            }
            Err(e) => {
                error!(task_id = %task.task_id, filename = %task.filename, line_number = n,
                    error = %format!("{e:#}"), "writing fragment failed, leaving it for redelivery");
                Step::Done(FragmentOutcome::Failed(format!("{e:#}")))
            }
        }
    }

    fn settle(&self, outcome: &FragmentOutcome, delivery: Option<&dyn Delivery>, report: &mut BatchReport) {
        report.record(outcome);
        match outcome {
            FragmentOutcome::Written { .. } => self.count(FRAGMENTS_WRITTEN),
            FragmentOutcome::Completed { .. } => {
                self.count(FRAGMENTS_WRITTEN);
                self.count(TASKS_COMPLETED);
            }
            FragmentOutcome::DroppedComplete | FragmentOutcome::DroppedQuarantined => {
                self.count(FRAGMENTS_DROPPED);
            }
            FragmentOutcome::Malformed(_) => self.count(FRAGMENTS_MALFORMED),
            FragmentOutcome::Quarantined(_) => self.count(TASKS_QUARANTINED),
            FragmentOutcome::Failed(_) => self.count(FRAGMENTS_FAILED),
        }
        if !outcome.acknowledges() {
            return;
        }
        if let Some(delivery) = delivery {
            match delivery.ack() {
                Ok(()) => report.acked += 1,
                Err(e) => {
                    report.ack_errors += 1;
                    warn!(error = %e, "acknowledging message failed");
                }
            }
        }
    }

    /// Drain one task's work list. Returns outcomes keyed by input index.
    fn run_worklist(
        &self,
        task: &TaskRef,
        mut queue: VecDeque<WorkItem>,
    ) -> (BatchReport, Vec<(usize, FragmentOutcome)>) {
        let paths = self.paths(task);
        let mut tracker = RetryTracker::new(self.config.retry);
        let mut report = BatchReport::default();
        let mut outcomes = Vec::with_capacity(queue.len());

        while let Some(item) = queue.pop_front() {
            match self.step(&paths, task, &item.fragment, &mut tracker) {
                Step::Requeue => {
                    report.requeued += 1;
                    self.count(FRAGMENTS_REQUEUED);
                    queue.push_back(item);
                }
                Step::Done(outcome) => {
                    self.settle(&outcome, item.delivery.as_deref(), &mut report);
                    outcomes.push((item.index, outcome));
                }
            }
        }
        (report, outcomes)
    }

    fn run_groups(
        &self,
        groups: Vec<(TaskRef, VecDeque<WorkItem>)>,
    ) -> Vec<(BatchReport, Vec<(usize, FragmentOutcome)>)> {
        #[cfg(feature = "parallel-tasks")]
        {
            if let Some(pool) = &self.pool
                && groups.len() > 1
            {
                return pool.install(|| {
                    groups
                        .into_par_iter()
                        .map(|(task, queue)| self.run_worklist(&task, queue))
                        .collect()
                });
            }
        }
        groups
            .into_iter()
            .map(|(task, queue)| self.run_worklist(&task, queue))
            .collect()
    }

    fn process_items(
        &self,
        items: Vec<(TaskRef, WorkItem)>,
        mut report: BatchReport,
        mut outcomes: Vec<Option<FragmentOutcome>>,
    ) -> (BatchReport, Vec<FragmentOutcome>) {
        let mut index_of: HashMap<TaskRef, usize> = HashMap::new();
        let mut groups: Vec<(TaskRef, VecDeque<WorkItem>)> = Vec::new();
        for (task, item) in items {
            if let Some(&i) = index_of.get(&task) {
                groups[i].1.push_back(item);
            } else {
                index_of.insert(task.clone(), groups.len());
                groups.push((task, VecDeque::from([item])));
            }
        }

        for (group_report, group_outcomes) in self.run_groups(groups) {
            report.merge(&group_report);
            for (index, outcome) in group_outcomes {
                outcomes[index] = Some(outcome);
            }
        }
        let outcomes = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| FragmentOutcome::Failed("fragment was not processed".into())))
            .collect();
        (report, outcomes)
    }

    /// Apply already-decoded fragments without a bus.
    ///
    /// Returns one outcome per input, in input order.
    pub fn apply_fragments(
        &self,
        fragments: impl IntoIterator<Item = (TaskRef, Fragment)>,
    ) -> (BatchReport, Vec<FragmentOutcome>) {
        let items: Vec<(TaskRef, WorkItem)> = fragments
            .into_iter()
            .enumerate()
            .map(|(index, (task, fragment))| {
                (
                    task,
                    WorkItem {
                        index,
                        fragment,
                        delivery: None,
                    },
                )
            })
            .collect();
        let report = BatchReport {
            received: items.len() as u64,
            ..Default::default()
        };
        let outcomes = vec![None; items.len()];
        self.process_items(items, report, outcomes)
    }

    /// Process one delivered batch and acknowledge what is settled.
    ///
    /// Malformed messages are logged, acknowledged and dropped. Every other
    /// message is routed to its task's work list.
    pub fn process_batch(
        &self,
        deliveries: Vec<Box<dyn Delivery>>,
    ) -> (BatchReport, Vec<FragmentOutcome>) {
        let mut report = BatchReport {
            received: deliveries.len() as u64,
            ..Default::default()
        };
        let mut outcomes: Vec<Option<FragmentOutcome>> = vec![None; deliveries.len()];
        let mut items = Vec::with_capacity(deliveries.len());

        for (index, delivery) in deliveries.into_iter().enumerate() {
            match decode(delivery.payload(), delivery.headers()) {
                Ok((task, fragment)) => items.push((
                    task,
                    WorkItem {
                        index,
                        fragment,
                        delivery: Some(delivery),
                    },
                )),
                Err(e) => {
                    error!(error = %e, headers = ?delivery.headers(), "dropping malformed message");
                    let outcome = FragmentOutcome::Malformed(e);
                    self.settle(&outcome, Some(delivery.as_ref()), &mut report);
                    outcomes[index] = Some(outcome);
                }
            }
        }
        self.process_items(items, report, outcomes)
    }

    /// Fetch and process batches until told to stop.
    ///
    /// Stops when `shutdown` is set, when the subscriber reports a terminal
    /// transport error, or, with [`ConsumeOptions::stop_when_idle`], after the
    /// first empty fetch. Per-fragment problems never end the loop. The
    /// subscriber is closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns the [`BusError`] that ended the loop.
    pub fn consume<S: Subscriber + ?Sized>(
        &self,
        subscriber: &mut S,
        options: ConsumeOptions,
        shutdown: &AtomicBool,
    ) -> Result<BatchReport, BusError> {
        let mut subscriber = SubscriberGuard::new(subscriber);
        let mut total = BatchReport::default();
        while !shutdown.load(Ordering::Relaxed) {
            let batch = match subscriber.fetch(options.batch_size.max(1)) {
                Ok(batch) => batch,
                Err(e) if e.is_terminal() => {
                    error!(error = %e, "bus connection lost, stopping consumer");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "fetch failed, retrying");
                    sleep(options.idle_poll);
                    continue;
                }
            };
            if batch.is_empty() {
                if options.stop_when_idle {
                    break;
                }
                sleep(options.idle_poll);
                continue;
            }
            let (report, _) = self.process_batch(batch);
            total.merge(&report);
        }
        Ok(total)
    }
}
