//! Stall handling: how long to wait for a predecessor, and when to give up.
//!
//! A fragment whose pending token is missing goes through two bounded loops:
//!
//! 1. within one pass it polls for the token [`RetryPolicy::max_file_lookups`]
//!    times, sleeping [`RetryPolicy::lookup_interval`] in between;
//! 2. if the token never shows up, the fragment is pushed back onto the local
//!    work list, at most [`RetryPolicy::max_retries`] times per
//!    `(task_id, line_number)`.
//!
//! Once both are exhausted the task is quarantined.

use crate::config::RetryPolicy;
use crate::fragment::FragmentKey;
use std::collections::HashMap;
use std::thread::sleep;

/// What to do with a fragment whose predecessor never materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallDecision {
    /// Put it back on the local work list; `attempt` counts from 1.
    Requeue { attempt: u32 },
    /// Out of retries: quarantine the task.
    Quarantine,
}

/// Per-worklist retry bookkeeping.
#[derive(Debug)]
pub struct RetryTracker {
    policy: RetryPolicy,
    retries: HashMap<FragmentKey, u32>,
}

impl RetryTracker {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Poll `ready` until it returns `true` or the lookup budget runs out.
    ///
    /// `ready` is checked `max_file_lookups + 1` times with one sleep between
    /// consecutive checks. Returns whether it ever succeeded.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) -> bool {
        let interval = self.policy.lookup_interval();
        for lookup in 0..=self.policy.max_file_lookups {
            if ready() {
                return true;
            }
            if lookup < self.policy.max_file_lookups && !interval.is_zero() {
                sleep(interval);
            }
        }
        false
    }

    /// Record a stall of `key` and decide what happens next.
    pub fn on_stall(&mut self, key: FragmentKey) -> StallDecision {
        let count = self.retries.entry(key).or_insert(0);
        if *count < self.policy.max_retries {
            *count += 1;
            StallDecision::Requeue { attempt: *count }
        } else {
            StallDecision::Quarantine
        }
    }

    /// How many times `key` has been re-queued so far.
    #[must_use]
    pub fn retries(&self, key: &FragmentKey) -> u32 {
        self.retries.get(key).copied().unwrap_or(0)
    }

    /// Drop the bookkeeping for `key` once it is resolved.
    pub fn forget(&mut self, key: &FragmentKey) {
        self.retries.remove(key);
    }
}
