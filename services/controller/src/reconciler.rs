//! Reconciler for interruption protection.
//!
//! One pass:
//! 1. Read every persisted schedule (abort if the store is unreachable)
//! 2. Observe nodes and workloads (abort if nodes cannot be listed)
//! 3. Decide an action for every eligible or tracked workload
//! 4. Apply the actions, a bounded number of workloads at a time
//!
//! Every decision is made before the first mutation is issued. Each workload
//! is applied under its schedule-store lock and only if its schedule is still
//! the one the decision was based on. A failure on one workload never stops
//! the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use spotguard_id::WorkloadKey;
use spotguard_reconcile::{
    decide, Decision, FailureTracker, Observation, ScaleSchedule, ScheduleStatus, Timing,
    WorkloadState, DEFAULT_FAILURE_WINDOW, DEFAULT_MAX_FAILURES,
};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::cluster::{with_timeout, ClusterApi};
use crate::error::{ReconcileError, WorkloadError};
use crate::observer::{ClusterObserver, ClusterSnapshot, Seen};
use crate::schedule::{ScheduleStore, StoreError};
use crate::selector::WorkloadSelector;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub selector: WorkloadSelector,
    pub timing: Timing,

    /// Bound on every external call.
    pub api_timeout: Duration,

    /// Workloads applied concurrently within one cycle.
    pub max_concurrency: usize,

    /// Consecutive failures before a workload is reported at error level.
    pub max_failures: u32,
    pub failure_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            selector: WorkloadSelector::default(),
            timing: Timing::default(),
            api_timeout: Duration::from_secs(10),
            max_concurrency: 8,
            max_failures: DEFAULT_MAX_FAILURES,
            failure_window: DEFAULT_FAILURE_WINDOW,
        }
    }
}

/// Which workloads a pass considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Only workloads with a persisted schedule.
    Recovery,
    /// Every protected workload plus every tracked one.
    Full,
}

/// Statistics from a reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub evaluated: usize,
    pub protected: usize,
    pub extended: usize,
    pub converged: usize,
    pub scaled_down: usize,
    pub forgotten: usize,
    pub failed: usize,
    /// Workloads whose namespace or pod placements could not be read.
    pub unobserved: usize,
    /// Schedule records that could not be decoded.
    pub corrupt: usize,
}

impl CycleStats {
    /// Whether anything was written.
    pub fn changed(&self) -> bool {
        self.protected + self.extended + self.converged + self.scaled_down + self.forgotten > 0
    }
}

/// A decided action for one workload.
#[derive(Debug)]
struct Plan {
    key: WorkloadKey,
    /// Schedule the decision was based on.
    prior: Option<ScaleSchedule>,
    current_replicas: Option<i32>,
    decision: Decision,
}

/// The interruption-protection reconciler.
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    observer: ClusterObserver,
    store: Arc<ScheduleStore>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    failures: Mutex<FailureTracker<WorkloadKey>>,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<ScheduleStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            observer: ClusterObserver::new(Arc::clone(&cluster), config.api_timeout),
            failures: Mutex::new(FailureTracker::new(
                config.max_failures,
                config.failure_window,
            )),
            cluster,
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Re-evaluate every persisted schedule against current cluster state.
    ///
    /// Run once at startup before the first timed pass so interruptions that
    /// began before a restart keep their protection and stale schedules are
    /// cleaned up.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<CycleStats, ReconcileError> {
        let stats = self.run_pass(Scope::Recovery).await?;
        info!(
            evaluated = stats.evaluated,
            scaled_down = stats.scaled_down,
            forgotten = stats.forgotten,
            failed = stats.failed,
            corrupt = stats.corrupt,
            "Recovery pass complete"
        );
        Ok(stats)
    }

    /// Run a single reconciliation pass.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<CycleStats, ReconcileError> {
        self.run_pass(Scope::Full).await
    }

    async fn run_pass(&self, scope: Scope) -> Result<CycleStats, ReconcileError> {
        let listing = self
            .store
            .list_all()
            .await
            .map_err(ReconcileError::StoreUnavailable)?;
        let corrupt = listing.corrupt.len();
        let schedules: BTreeMap<WorkloadKey, ScaleSchedule> = listing
            .schedules
            .into_iter()
            .map(|s| (s.workload.clone(), s))
            .collect();
        let tracked: BTreeSet<WorkloadKey> = schedules.keys().cloned().collect();

        let label = match scope {
            Scope::Full => Some(self.config.selector.label()),
            Scope::Recovery => None,
        };
        let snapshot = self
            .observer
            .observe(self.config.selector.policy(), label, &tracked)
            .await?;

        let now = self.clock.now();
        let mut stats = CycleStats {
            corrupt,
            ..Default::default()
        };
        let plans = self.plan(&snapshot, &schedules, now, &mut stats);

        let results: Vec<(WorkloadKey, Result<&'static str, WorkloadError>)> =
            stream::iter(plans)
                .map(|plan| async move {
                    let key = plan.key.clone();
                    (key, self.apply(plan).await)
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

        self.tally(results, &mut stats);
        self.store.prune_locks();

        if stats.changed() || stats.failed > 0 || stats.corrupt > 0 {
            info!(
                evaluated = stats.evaluated,
                protected = stats.protected,
                extended = stats.extended,
                converged = stats.converged,
                scaled_down = stats.scaled_down,
                forgotten = stats.forgotten,
                failed = stats.failed,
                unobserved = stats.unobserved,
                corrupt = stats.corrupt,
                "Reconciliation pass complete"
            );
        } else {
            debug!(evaluated = stats.evaluated, "Reconciliation pass complete, no changes");
        }

        Ok(stats)
    }

    /// Decide every workload. Only mutating plans are returned.
    fn plan(
        &self,
        snapshot: &ClusterSnapshot,
        schedules: &BTreeMap<WorkloadKey, ScaleSchedule>,
        now: chrono::DateTime<chrono::Utc>,
        stats: &mut CycleStats,
    ) -> Vec<Plan> {
        let selector = &self.config.selector;
        let observed: Vec<_> = snapshot.workloads.values().collect();
        let eligible: BTreeSet<WorkloadKey> = selector
            .select(&observed, |w| (&w.info, w.selector.as_ref()))
            .into_iter()
            .map(|w| w.key.clone())
            .collect();

        let states: BTreeMap<WorkloadKey, WorkloadState> = snapshot
            .workloads
            .values()
            .map(|w| {
                let state = WorkloadState {
                    key: w.key.clone(),
                    replicas: w.info.replicas,
                    placements: w.placements.clone(),
                    eligible: eligible.contains(&w.key),
                };
                (w.key.clone(), state)
            })
            .collect();

        let keys: BTreeSet<&WorkloadKey> = eligible.iter().chain(schedules.keys()).collect();

        let mut plans = Vec::new();
        for key in keys {
            stats.evaluated += 1;
            let observation = match snapshot.lookup(key) {
                // Without a pod selector the placements are unknown, not empty.
                Seen::Present(w) if w.selector.is_none() => {
                    if schedules.contains_key(key) {
                        warn!(workload = %key, "Cannot resolve pod selector, schedule held");
                    }
                    stats.unobserved += 1;
                    Observation::Unknown
                }
                Seen::Present(_) => match states.get(key) {
                    Some(state) => Observation::Present(state),
                    None => Observation::Unknown,
                },
                Seen::Missing => Observation::Missing,
                Seen::Unknown => {
                    stats.unobserved += 1;
                    Observation::Unknown
                }
            };
            let prior = schedules.get(key);
            let decision = decide(
                observation,
                &snapshot.nodes,
                prior,
                now,
                &self.config.timing,
            );
            debug!(workload = %key, decision = decision.kind(), "Decided");

            if decision.is_mutation() {
                plans.push(Plan {
                    key: key.clone(),
                    prior: prior.cloned(),
                    current_replicas: states.get(key).map(|s| s.replicas),
                    decision,
                });
            }
        }
        plans
    }

    /// Apply one plan inside the workload's critical section.
    async fn apply(&self, plan: Plan) -> Result<&'static str, WorkloadError> {
        let key = plan.key;
        let _guard = self.store.lock(&key).await;

        // Unreadable records were skipped by the listing too; the decision
        // treats them as absent and a successful write replaces them.
        let current = match self.store.get(&key).await {
            Ok(current) => current,
            Err(StoreError::Corrupt { .. }) => None,
            Err(source) => {
                return Err(WorkloadError::Store {
                    key: key.clone(),
                    source,
                })
            }
        };
        if current != plan.prior {
            return Err(WorkloadError::Superseded(key));
        }

        let kind = plan.decision.kind();
        match plan.decision {
            Decision::NoOp => {}
            Decision::Protect {
                schedule,
                target_replicas,
            } => {
                // Intent first: a crash after this write is repaired next pass.
                self.put(&key, &schedule).await?;
                self.set_replicas(&key, target_replicas).await?;
                info!(
                    workload = %key,
                    baseline_replicas = schedule.baseline_replicas,
                    target_replicas,
                    nodes = ?schedule.tracked_nodes,
                    scale_down_at = %schedule.scale_down_at,
                    "Interruption detected, scaled up"
                );
            }
            Decision::Extend {
                schedule,
                target_replicas,
                reason,
            } => {
                self.put(&key, &schedule).await?;
                if let Some(target) = target_replicas {
                    self.set_replicas(&key, target).await?;
                }
                info!(
                    workload = %key,
                    reason = reason.as_str(),
                    target_replicas = schedule.target_replicas,
                    nodes = ?schedule.tracked_nodes,
                    scale_down_at = %schedule.scale_down_at,
                    "Protection extended"
                );
            }
            Decision::Converge { target_replicas } => {
                self.set_replicas(&key, target_replicas).await?;
                info!(workload = %key, target_replicas, "Restored protected replica count");
            }
            Decision::ScaleDown {
                schedule,
                baseline_replicas,
            } => {
                self.put(&key, &schedule).await?;
                if plan.current_replicas != Some(baseline_replicas) {
                    self.set_replicas(&key, baseline_replicas).await?;
                }
                if let Err(source) = self.store.delete(&key).await {
                    // Mark resolved so the next reader drops it without scaling again.
                    let mut resolved = schedule;
                    resolved.status = ScheduleStatus::None;
                    if let Err(e) = self.store.put(&resolved).await {
                        warn!(workload = %key, error = %e, "Failed to mark schedule resolved");
                    }
                    return Err(WorkloadError::Store { key, source });
                }
                info!(workload = %key, baseline_replicas, "Scaled back down to baseline");
            }
            Decision::Forget { reason } => {
                self.store
                    .delete(&key)
                    .await
                    .map_err(|source| WorkloadError::Store {
                        key: key.clone(),
                        source,
                    })?;
                info!(workload = %key, reason = reason.as_str(), "Schedule dropped");
            }
        }

        Ok(kind)
    }

    async fn put(&self, key: &WorkloadKey, schedule: &ScaleSchedule) -> Result<(), WorkloadError> {
        self.store
            .put(schedule)
            .await
            .map_err(|source| WorkloadError::Store {
                key: key.clone(),
                source,
            })
    }

    async fn set_replicas(&self, key: &WorkloadKey, replicas: i32) -> Result<(), WorkloadError> {
        with_timeout(
            self.config.api_timeout,
            "set_replicas",
            self.cluster.set_replicas(key, replicas),
        )
        .await
        .map_err(|source| WorkloadError::Cluster {
            key: key.clone(),
            source,
        })
    }

    fn tally(
        &self,
        results: Vec<(WorkloadKey, Result<&'static str, WorkloadError>)>,
        stats: &mut CycleStats,
    ) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());

        for (key, result) in results {
            match result {
                Ok(kind) => {
                    failures.clear(&key);
                    match kind {
                        "protect" => stats.protected += 1,
                        "extend" => stats.extended += 1,
                        "converge" => stats.converged += 1,
                        "scale_down" => stats.scaled_down += 1,
                        "forget" => stats.forgotten += 1,
                        _ => {}
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    if !e.is_transient() {
                        warn!(workload = %key, error = %e, "Workload skipped this cycle");
                    } else if failures.record_failure(&key) {
                        error!(
                            workload = %key,
                            error = %e,
                            failures = failures.failures(&key),
                            "Workload keeps failing to reconcile"
                        );
                    } else {
                        warn!(workload = %key, error = %e, "Failed to reconcile workload, will retry");
                    }
                }
            }
        }

        failures.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::MemoryCluster;
    use crate::schedule::MemoryRecords;
    use chrono::{TimeZone, Utc};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<MemoryCluster>, Arc<ScheduleStore>, Reconciler) {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1", &[]);
        cluster.add_workload("qa", "web", 1, &[("spot-guard.io/protected", "true")]);
        cluster.add_pod("qa", "web", "n1");
        cluster.cordon("n1");
        let store = Arc::new(ScheduleStore::new(
            Arc::new(MemoryRecords::new()),
            Duration::from_secs(1),
        ));
        let reconciler = Reconciler::new(
            cluster.clone(),
            Arc::clone(&store),
            Arc::new(ManualClock::new(t0())),
            ReconcilerConfig::default(),
        );
        (cluster, store, reconciler)
    }

    #[test]
    fn test_cycle_stats_changed() {
        let mut stats = CycleStats {
            evaluated: 4,
            failed: 1,
            unobserved: 2,
            ..Default::default()
        };
        assert!(!stats.changed());
        stats.forgotten = 1;
        assert!(stats.changed());
    }

    #[tokio::test]
    async fn test_apply_rejects_superseded_schedule() {
        let (cluster, store, reconciler) = setup();
        let key = WorkloadKey::parse("qa/web").unwrap();

        let snapshot = reconciler
            .observer
            .observe(
                reconciler.config.selector.policy(),
                Some(reconciler.config.selector.label()),
                &BTreeSet::new(),
            )
            .await
            .unwrap();
        let mut stats = CycleStats::default();
        let mut plans = reconciler.plan(&snapshot, &BTreeMap::new(), t0(), &mut stats);
        assert_eq!(plans.len(), 1);

        // Someone else protects the workload between decision and apply.
        let other = ScaleSchedule::open(
            key.clone(),
            1,
            ["n1".to_string()].into(),
            t0(),
            &Timing::default(),
        );
        store.put(&other).await.unwrap();

        let err = reconciler.apply(plans.remove(0)).await.unwrap_err();
        assert!(matches!(err, WorkloadError::Superseded(_)));
        assert!(cluster.replica_writes().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_skips_write_when_already_at_baseline() {
        let (cluster, store, reconciler) = setup();
        let key = WorkloadKey::parse("qa/web").unwrap();

        let schedule = ScaleSchedule::open(
            key.clone(),
            1,
            ["n1".to_string()].into(),
            t0() - chrono::TimeDelta::seconds(600),
            &Timing::default(),
        );
        store.put(&schedule).await.unwrap();
        cluster.evict_node("n1");

        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.scaled_down, 1);
        assert!(cluster.replica_writes().is_empty());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
