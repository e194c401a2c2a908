//! Reconciliation primitives for spot-guard.
//!
//! This library holds everything about interruption protection that does not
//! touch the network:
//!
//! - **Model**: observed nodes and workloads, and the persisted
//!   [`ScaleSchedule`] that records a pending scale-down.
//! - **Engine**: [`decide`], which maps observed state plus the current
//!   schedule to the next [`Decision`] for one workload.
//! - **Failure tracking**: [`FailureTracker`], which notices workloads that
//!   keep failing cycle after cycle.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Replica changes are absolute targets, never deltas
//! - A schedule's deadline only moves later while it is pending

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub mod engine;
pub mod model;

pub use engine::{decide, Decision, ExtendReason, ForgetReason, Observation, Timing};
pub use model::{
    CapacityClass, ClusterNodes, ModelError, NodeState, ScaleSchedule, ScheduleStatus,
    WorkloadState,
};

/// Tracks consecutive failures per resource.
#[derive(Debug, Clone)]
pub struct FailureTracker<K> {
    /// Failures tolerated before a resource counts as persistently failing.
    max_failures: u32,

    /// Window after which a failure streak starts over.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> FailureTracker<K> {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true once the resource has failed more than `max_failures`
    /// times within the window.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_failures
    }

    /// Number of failures currently counted for a resource.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default interval between reconciliation cycles.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;

/// Default dwell after a scale-up before scale-down may fire.
pub const DEFAULT_SCALE_UP_DELAY_SECS: u64 = 60;

/// Default time from the latest interruption to the scale-down deadline.
pub const DEFAULT_SCALE_DOWN_DELAY_SECS: u64 = 300;

/// Longest accepted scale-up or scale-down delay (7 days).
pub const MAX_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// Default consecutive failures tolerated per workload before escalating.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default failure window.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
