//! Scaling decision engine.
//!
//! A pure function of (observed workload, nodes, persisted schedule, now).
//! Per workload the engine walks `Stable → Protected → Stable`:
//!
//! - No schedule and a placement on a cordoned node: open a schedule and
//!   raise replicas to `baseline + at-risk nodes`.
//! - Protected and a further node becomes cordoned: track it, raise the
//!   target by one and push the deadline out. Tracked nodes the workload has
//!   left are released first, so a replica hopping between interrupted nodes
//!   does not raise the target again.
//! - Deadline and dwell elapsed, nothing at risk: scale back to baseline.
//! - Deadline elapsed but still at risk: re-arm the deadline.
//!
//! Replica changes are always expressed as absolute targets, so applying the
//! same decision twice is harmless.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};

use crate::model::{ClusterNodes, ScaleSchedule, ScheduleStatus, WorkloadState};
use crate::{DEFAULT_SCALE_DOWN_DELAY_SECS, DEFAULT_SCALE_UP_DELAY_SECS, MAX_DELAY_SECS};

/// Delays that drive the protection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Minimum dwell after a scale-up before a scale-down may fire.
    pub scale_up_delay: TimeDelta,
    /// Time from the latest interruption until the scale-down deadline.
    pub scale_down_delay: TimeDelta,
}

impl Timing {
    /// Delays above [`MAX_DELAY_SECS`] are clamped.
    pub fn from_secs(scale_up_delay: u64, scale_down_delay: u64) -> Self {
        let delay = |secs: u64| TimeDelta::seconds(secs.min(MAX_DELAY_SECS) as i64);
        Self {
            scale_up_delay: delay(scale_up_delay),
            scale_down_delay: delay(scale_down_delay),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_secs(DEFAULT_SCALE_UP_DELAY_SECS, DEFAULT_SCALE_DOWN_DELAY_SECS)
    }
}

/// What the observer knows about a workload this cycle.
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    /// The workload was read successfully.
    Present(&'a WorkloadState),
    /// The workload's namespace was read and the workload does not exist.
    Missing,
    /// The workload's namespace could not be read this cycle.
    Unknown,
}

/// Why a schedule's deadline or target changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendReason {
    /// Another node hosting the workload was cordoned.
    NewInterruption,
    /// The deadline elapsed while a placement was still at risk.
    AtRiskAtDeadline,
    /// An unfinished scale-down was abandoned before its deadline.
    Resumed,
}

impl ExtendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewInterruption => "new_interruption",
            Self::AtRiskAtDeadline => "at_risk_at_deadline",
            Self::Resumed => "resumed",
        }
    }
}

/// Why a schedule is dropped without a replica change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetReason {
    /// The scale-down already landed.
    Resolved,
    /// The workload no longer exists and the deadline has passed.
    WorkloadGone,
}

impl ForgetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::WorkloadGone => "workload_gone",
        }
    }
}

/// Action computed for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do.
    NoOp,
    /// Write the new schedule, then set replicas to the target.
    Protect {
        schedule: ScaleSchedule,
        target_replicas: i32,
    },
    /// Write the updated schedule, then set replicas if below target.
    Extend {
        schedule: ScaleSchedule,
        target_replicas: Option<i32>,
        reason: ExtendReason,
    },
    /// Replicas fell below the persisted target; set them back.
    Converge { target_replicas: i32 },
    /// Record the `executing` schedule, set replicas to baseline, delete it.
    ScaleDown {
        schedule: ScaleSchedule,
        baseline_replicas: i32,
    },
    /// Delete the schedule.
    Forget { reason: ForgetReason },
}

impl Decision {
    /// Whether the decision mutates replicas or the schedule store.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Protect { .. } => "protect",
            Self::Extend { .. } => "extend",
            Self::Converge { .. } => "converge",
            Self::ScaleDown { .. } => "scale_down",
            Self::Forget { .. } => "forget",
        }
    }
}

/// Compute the next action for one workload.
pub fn decide(
    observation: Observation<'_>,
    nodes: &ClusterNodes,
    schedule: Option<&ScaleSchedule>,
    now: DateTime<Utc>,
    timing: &Timing,
) -> Decision {
    match (schedule, observation) {
        (_, Observation::Unknown) => Decision::NoOp,
        (None, Observation::Missing) => Decision::NoOp,
        (None, Observation::Present(workload)) => decide_stable(workload, nodes, now, timing),
        (Some(schedule), _) if schedule.status == ScheduleStatus::None => Decision::Forget {
            reason: ForgetReason::Resolved,
        },
        (Some(schedule), Observation::Missing) => {
            if now >= schedule.scale_down_at {
                Decision::Forget {
                    reason: ForgetReason::WorkloadGone,
                }
            } else {
                Decision::NoOp
            }
        }
        (Some(schedule), Observation::Present(workload)) => {
            decide_protected(schedule, workload, nodes, now, timing)
        }
    }
}

fn decide_stable(
    workload: &WorkloadState,
    nodes: &ClusterNodes,
    now: DateTime<Utc>,
    timing: &Timing,
) -> Decision {
    if !workload.eligible || workload.replicas <= 0 {
        return Decision::NoOp;
    }

    let at_risk = workload.at_risk_nodes(nodes);
    if at_risk.is_empty() {
        return Decision::NoOp;
    }

    let schedule = ScaleSchedule::open(
        workload.key.clone(),
        workload.replicas,
        at_risk,
        now,
        timing,
    );
    Decision::Protect {
        target_replicas: schedule.target_replicas,
        schedule,
    }
}

fn decide_protected(
    schedule: &ScaleSchedule,
    workload: &WorkloadState,
    nodes: &ClusterNodes,
    now: DateTime<Utc>,
    timing: &Timing,
) -> Decision {
    let at_risk = workload.at_risk_nodes(nodes);
    let mut current = schedule.clone();
    current.release(workload);

    // Ineligible workloads run their schedule out but gain no new coverage.
    let untracked: BTreeSet<String> = if workload.eligible {
        at_risk.difference(&current.tracked_nodes).cloned().collect()
    } else {
        BTreeSet::new()
    };

    if !untracked.is_empty() {
        current.track(untracked, now, timing);
        return extend(current, workload, ExtendReason::NewInterruption);
    }

    if current.is_due(now) {
        if at_risk.is_empty() {
            let baseline_replicas = current.baseline_replicas;
            current.status = ScheduleStatus::Executing;
            current.updated_at = now;
            return Decision::ScaleDown {
                baseline_replicas,
                schedule: current,
            };
        }
        current.rearm(now, timing);
        return extend(current, workload, ExtendReason::AtRiskAtDeadline);
    }

    if current.status == ScheduleStatus::Executing {
        current.status = ScheduleStatus::Pending;
        current.updated_at = now;
        return extend(current, workload, ExtendReason::Resumed);
    }

    if workload.replicas < current.target_replicas {
        return Decision::Converge {
            target_replicas: current.target_replicas,
        };
    }

    Decision::NoOp
}

fn extend(schedule: ScaleSchedule, workload: &WorkloadState, reason: ExtendReason) -> Decision {
    let target_replicas =
        (workload.replicas < schedule.target_replicas).then_some(schedule.target_replicas);
    Decision::Extend {
        schedule,
        target_replicas,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapacityClass, NodeState};
    use chrono::TimeZone;
    use rstest::rstest;
    use spotguard_id::WorkloadKey;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    fn nodes(disabled: &[&str], healthy: &[&str]) -> ClusterNodes {
        let make = |name: &&str, disabled| NodeState {
            name: name.to_string(),
            capacity_class: CapacityClass::Interruptible,
            scheduling_disabled: disabled,
        };
        ClusterNodes::new(
            disabled
                .iter()
                .map(|n| make(n, true))
                .chain(healthy.iter().map(|n| make(n, false))),
        )
    }

    fn workload(replicas: i32, placements: &[&str]) -> WorkloadState {
        WorkloadState {
            key: WorkloadKey::parse("qa/web").unwrap(),
            replicas,
            placements: placements.iter().map(|s| s.to_string()).collect(),
            eligible: true,
        }
    }

    fn protect(w: &WorkloadState, nodes: &ClusterNodes, now: DateTime<Utc>) -> ScaleSchedule {
        match decide(Observation::Present(w), nodes, None, now, &Timing::default()) {
            Decision::Protect { schedule, .. } => schedule,
            other => panic!("expected protect, got {other:?}"),
        }
    }

    #[test]
    fn test_healthy_workload_is_left_alone() {
        let w = workload(1, &["n1"]);
        let d = decide(
            Observation::Present(&w),
            &nodes(&[], &["n1"]),
            None,
            t0(),
            &Timing::default(),
        );
        assert_eq!(d, Decision::NoOp);
    }

    #[test]
    fn test_first_interruption_opens_schedule() {
        let w = workload(1, &["n1"]);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n1"], &["n2"]),
            None,
            t0(),
            &Timing::default(),
        );
        let Decision::Protect {
            schedule,
            target_replicas,
        } = d
        else {
            panic!("expected protect");
        };
        assert_eq!(target_replicas, 2);
        assert_eq!(schedule.baseline_replicas, 1);
        assert_eq!(schedule.scale_down_at, t0() + secs(300));
        assert_eq!(schedule.settles_at, t0() + secs(60));
    }

    #[rstest]
    #[case::ineligible(false, 1)]
    #[case::scaled_to_zero(true, 0)]
    fn test_no_protection_without_eligibility_or_replicas(
        #[case] eligible: bool,
        #[case] replicas: i32,
    ) {
        let mut w = workload(replicas, &["n1"]);
        w.eligible = eligible;
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n1"], &[]),
            None,
            t0(),
            &Timing::default(),
        );
        assert_eq!(d, Decision::NoOp);
    }

    #[test]
    fn test_same_cycle_twice_is_stable() {
        let cluster = nodes(&["n1"], &["n2"]);
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &cluster, t0());

        // Scale-up applied; replacement pod scheduled on n2.
        let w = workload(2, &["n1", "n2"]);
        let now = t0() + secs(30);
        let first = decide(Observation::Present(&w), &cluster, Some(&schedule), now, &Timing::default());
        let second = decide(Observation::Present(&w), &cluster, Some(&schedule), now, &Timing::default());
        assert_eq!(first, Decision::NoOp);
        assert_eq!(second, Decision::NoOp);
    }

    #[test]
    fn test_converges_after_lost_scale_up() {
        let cluster = nodes(&["n1"], &[]);
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &cluster, t0());

        // The intent was written but the replica change never landed.
        let d = decide(
            Observation::Present(&w),
            &cluster,
            Some(&schedule),
            t0() + secs(10),
            &Timing::default(),
        );
        assert_eq!(d, Decision::Converge { target_replicas: 2 });
    }

    #[test]
    fn test_scale_down_after_deadline() {
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &nodes(&["n1"], &["n2"]), t0());

        // Original pod is gone; only the replacement on n2 remains.
        let w = workload(2, &["n2"]);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n1"], &["n2"]),
            Some(&schedule),
            t0() + secs(301),
            &Timing::default(),
        );
        let Decision::ScaleDown {
            schedule,
            baseline_replicas,
        } = d
        else {
            panic!("expected scale down");
        };
        assert_eq!(baseline_replicas, 1);
        assert_eq!(schedule.status, ScheduleStatus::Executing);
    }

    #[test]
    fn test_no_scale_down_before_deadline() {
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &nodes(&["n1"], &["n2"]), t0());
        let w = workload(2, &["n2"]);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n1"], &["n2"]),
            Some(&schedule),
            t0() + secs(299),
            &Timing::default(),
        );
        assert_eq!(d, Decision::NoOp);
    }

    #[test]
    fn test_scale_up_dwell_holds_scale_down() {
        let timing = Timing::from_secs(600, 300);
        let w = workload(1, &["n1"]);
        let cluster = nodes(&["n1"], &["n2"]);
        let Decision::Protect { schedule, .. } =
            decide(Observation::Present(&w), &cluster, None, t0(), &timing)
        else {
            panic!("expected protect");
        };

        let w = workload(2, &["n2"]);
        let held = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(301), &timing);
        assert_eq!(held, Decision::NoOp);

        let fired = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(600), &timing);
        assert_eq!(fired.kind(), "scale_down");
    }

    #[test]
    fn test_rearm_when_still_at_risk_at_deadline() {
        let cluster = nodes(&["n1"], &[]);
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &cluster, t0());

        let w = workload(2, &["n1", "n1"]);
        let now = t0() + secs(305);
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), now, &Timing::default());
        let Decision::Extend {
            schedule,
            target_replicas,
            reason,
        } = d
        else {
            panic!("expected extend");
        };
        assert_eq!(reason, ExtendReason::AtRiskAtDeadline);
        assert_eq!(target_replicas, None);
        assert_eq!(schedule.scale_down_at, now + secs(300));
        assert_eq!(schedule.target_replicas, 2);
    }

    #[test]
    fn test_second_interruption_extends_and_raises() {
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &nodes(&["n1"], &["n2"]), t0());

        // Replacement landed on n2, which is now cordoned as well.
        let w = workload(2, &["n1", "n2"]);
        let now = t0() + secs(120);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n1", "n2"], &["n3"]),
            Some(&schedule),
            now,
            &Timing::default(),
        );
        let Decision::Extend {
            schedule,
            target_replicas,
            reason,
        } = d
        else {
            panic!("expected extend");
        };
        assert_eq!(reason, ExtendReason::NewInterruption);
        assert_eq!(target_replicas, Some(3));
        assert_eq!(schedule.scale_down_at, now + secs(300));
        assert_eq!(schedule.tracked_nodes.len(), 2);
    }

    #[test]
    fn test_replica_hopping_across_interrupted_nodes_keeps_target() {
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &nodes(&["n1"], &["n2"]), t0());

        // n1 drained and removed; the pods now run on n2, which gets cordoned.
        let w = workload(2, &["n2", "n2"]);
        let now = t0() + secs(200);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n2"], &["n3"]),
            Some(&schedule),
            now,
            &Timing::default(),
        );
        let Decision::Extend {
            schedule,
            target_replicas,
            reason,
        } = d
        else {
            panic!("expected extend");
        };
        assert_eq!(reason, ExtendReason::NewInterruption);
        assert_eq!(target_replicas, None);
        assert_eq!(schedule.target_replicas, 2);
        assert_eq!(schedule.tracked_nodes, ["n2".to_string()].into());
        assert_eq!(schedule.scale_down_at, now + secs(300));

        // Same again for n2 -> n3.
        let w = workload(2, &["n3", "n3"]);
        let d = decide(
            Observation::Present(&w),
            &nodes(&["n3"], &["n4"]),
            Some(&schedule),
            now + secs(100),
            &Timing::default(),
        );
        let Decision::Extend { schedule, target_replicas, .. } = d else {
            panic!("expected extend");
        };
        assert_eq!(target_replicas, None);
        assert_eq!(schedule.target_replicas, 2);
        schedule.validate().unwrap();
    }

    #[test]
    fn test_absurd_delay_is_clamped() {
        let timing = Timing::from_secs(u64::MAX, u64::MAX);
        assert_eq!(timing.scale_down_delay, secs(MAX_DELAY_SECS as i64));
        // Adding the clamped delay to a timestamp must not overflow.
        let _ = t0() + timing.scale_up_delay + timing.scale_down_delay;
    }

    #[test]
    fn test_three_interruptions_track_every_node() {
        let cluster = nodes(&["n1", "n2", "n3"], &[]);
        let w = workload(1, &["n1", "n2", "n3"]);
        let schedule = protect(&w, &cluster, t0());
        assert_eq!(schedule.target_replicas, 4);
    }

    #[test]
    fn test_ineligible_workload_runs_schedule_out() {
        let w = workload(1, &["n1"]);
        let schedule = protect(&w, &nodes(&["n1"], &["n2"]), t0());

        let mut w = workload(2, &["n2"]);
        w.eligible = false;
        let cluster = nodes(&["n1", "n2"], &[]);

        // New at-risk node is not tracked for an ineligible workload.
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(10), &Timing::default());
        assert_eq!(d, Decision::NoOp);

        // Still at risk at the deadline: re-armed rather than scaled down.
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(300), &Timing::default());
        assert_eq!(d.kind(), "extend");

        let cluster = nodes(&["n1"], &["n2"]);
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(300), &Timing::default());
        assert_eq!(d.kind(), "scale_down");
    }

    #[test]
    fn test_missing_workload_forgotten_after_deadline() {
        let w = workload(1, &["n1"]);
        let cluster = nodes(&["n1"], &[]);
        let schedule = protect(&w, &cluster, t0());

        let early = decide(Observation::Missing, &cluster, Some(&schedule), t0() + secs(5), &Timing::default());
        assert_eq!(early, Decision::NoOp);

        let late = decide(Observation::Missing, &cluster, Some(&schedule), t0() + secs(300), &Timing::default());
        assert_eq!(
            late,
            Decision::Forget {
                reason: ForgetReason::WorkloadGone
            }
        );
    }

    #[test]
    fn test_unknown_observation_never_mutates() {
        let w = workload(1, &["n1"]);
        let cluster = nodes(&["n1"], &[]);
        let schedule = protect(&w, &cluster, t0());
        let d = decide(Observation::Unknown, &cluster, Some(&schedule), t0() + secs(3600), &Timing::default());
        assert!(!d.is_mutation());
    }

    #[test]
    fn test_executing_schedule_reenters_scale_down() {
        let w = workload(1, &["n1"]);
        let cluster = nodes(&["n1"], &["n2"]);
        let mut schedule = protect(&w, &cluster, t0());
        schedule.status = ScheduleStatus::Executing;

        // Crash after recording the scale-down intent; replicas already at baseline.
        let w = workload(1, &["n2"]);
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), t0() + secs(400), &Timing::default());
        assert_eq!(d.kind(), "scale_down");
    }

    #[test]
    fn test_resolved_schedule_is_forgotten() {
        let w = workload(1, &["n1"]);
        let cluster = nodes(&["n1"], &[]);
        let mut schedule = protect(&w, &cluster, t0());
        schedule.status = ScheduleStatus::None;
        let d = decide(Observation::Present(&w), &cluster, Some(&schedule), t0(), &Timing::default());
        assert_eq!(
            d,
            Decision::Forget {
                reason: ForgetReason::Resolved
            }
        );
    }
}
