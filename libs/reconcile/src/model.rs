//! Observed cluster state and the persisted scale schedule.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spotguard_id::WorkloadKey;
use thiserror::Error;

use crate::engine::Timing;

/// Errors raised when a persisted schedule violates its invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("schedule for {workload}: baseline replicas must be positive, got {baseline}")]
    InvalidBaseline { workload: WorkloadKey, baseline: i32 },

    #[error(
        "schedule for {workload}: target {target} does not cover baseline {baseline} + {tracked} tracked nodes"
    )]
    TargetMismatch {
        workload: WorkloadKey,
        baseline: i32,
        target: i32,
        tracked: usize,
    },
}

// =============================================================================
// Nodes
// =============================================================================

/// Well-known node labels that describe how a node was provisioned.
const CAPACITY_LABELS: &[(&str, &str, CapacityClass)] = &[
    ("karpenter.sh/capacity-type", "spot", CapacityClass::Interruptible),
    ("karpenter.sh/capacity-type", "on-demand", CapacityClass::OnDemand),
    ("eks.amazonaws.com/capacityType", "SPOT", CapacityClass::Interruptible),
    ("eks.amazonaws.com/capacityType", "ON_DEMAND", CapacityClass::OnDemand),
    ("cloud.google.com/gke-spot", "true", CapacityClass::Interruptible),
    ("cloud.google.com/gke-preemptible", "true", CapacityClass::Interruptible),
    ("kubernetes.azure.com/scalesetpriority", "spot", CapacityClass::Interruptible),
];

/// How a node was provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityClass {
    /// Spot or preemptible capacity that can be reclaimed at short notice.
    Interruptible,
    /// Regular on-demand capacity.
    OnDemand,
    /// No recognised capacity label.
    Unknown,
}

impl CapacityClass {
    /// Derive the capacity class from a node's labels.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        CAPACITY_LABELS
            .iter()
            .find(|(key, value, _)| labels.get(*key).is_some_and(|v| v == value))
            .map(|(_, _, class)| *class)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interruptible => "interruptible",
            Self::OnDemand => "on_demand",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node as seen by the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub capacity_class: CapacityClass,
    /// Cordoned: no new pods will be scheduled here.
    pub scheduling_disabled: bool,
}

/// Snapshot of every node in the cluster for one cycle.
#[derive(Debug, Clone, Default)]
pub struct ClusterNodes {
    nodes: BTreeMap<String, NodeState>,
}

impl ClusterNodes {
    pub fn new(nodes: impl IntoIterator<Item = NodeState>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// A node that no longer exists is not at risk: nothing runs there.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.nodes.get(name).is_some_and(|n| n.scheduling_disabled)
    }

    pub fn disabled_count(&self) -> usize {
        self.nodes.values().filter(|n| n.scheduling_disabled).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// A workload as seen by the observer, after selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadState {
    pub key: WorkloadKey,
    /// Desired replica count currently set on the workload.
    pub replicas: i32,
    /// Nodes hosting the workload's live pods (one entry per pod).
    pub placements: Vec<String>,
    /// Whether the workload currently passes label and namespace policy.
    pub eligible: bool,
}

impl WorkloadState {
    /// Distinct placement nodes that are scheduling-disabled.
    pub fn at_risk_nodes(&self, nodes: &ClusterNodes) -> BTreeSet<String> {
        self.placements
            .iter()
            .filter(|n| nodes.is_disabled(n))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Scale Schedule
// =============================================================================

/// Lifecycle of a persisted schedule.
///
/// The record is always written before the replica change it describes, so a
/// status names the last intent, not a completed mutation:
///
/// - `pending`: the scale-up or extension is recorded. Replicas may still be
///   below the target.
/// - `executing`: the scale-down is recorded. Replicas may still be above
///   baseline.
/// - `none`: the scale-down is confirmed and only the delete failed.
///
/// `pending` and `executing` are re-checked against live replicas every
/// cycle. Only `none` is purged without touching the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Replicas are elevated and the scale-down is outstanding.
    Pending,
    /// Scale-down intent recorded; the mutation back to baseline is unconfirmed.
    Executing,
    /// Scale-down confirmed; the record only awaits deletion.
    None,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a pending scale-down obligation.
///
/// All timestamps are wall-clock instants fixed when they are written, so a
/// restarted controller reads the same deadline it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSchedule {
    pub workload: WorkloadKey,
    /// Replica count before the first tracked interruption.
    pub baseline_replicas: i32,
    /// Replica count while protected. Never lower than baseline plus one
    /// per tracked node, and never lowered before the scale-down.
    pub target_replicas: i32,
    /// Interrupted nodes that still host a placement of the workload.
    pub tracked_nodes: BTreeSet<String>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the scale-down may fire (scale-up dwell).
    pub settles_at: DateTime<Utc>,
    /// Scale-down deadline.
    pub scale_down_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScaleSchedule {
    /// Open a schedule for a workload first seen on interrupted nodes.
    pub fn open(
        workload: WorkloadKey,
        baseline_replicas: i32,
        at_risk: BTreeSet<String>,
        now: DateTime<Utc>,
        timing: &Timing,
    ) -> Self {
        let target_replicas = baseline_replicas + at_risk.len() as i32;
        Self {
            workload,
            baseline_replicas,
            target_replicas,
            tracked_nodes: at_risk,
            status: ScheduleStatus::Pending,
            created_at: now,
            settles_at: now + timing.scale_up_delay,
            scale_down_at: now + timing.scale_down_delay,
            updated_at: now,
        }
    }

    /// Track additional interrupted nodes. The deadline only ever moves later
    /// and the target only ever rises.
    pub fn track(
        &mut self,
        nodes: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
        timing: &Timing,
    ) {
        self.tracked_nodes.extend(nodes);
        self.target_replicas = self
            .target_replicas
            .max(self.baseline_replicas + self.tracked_nodes.len() as i32);
        self.settles_at = self.settles_at.max(now + timing.scale_up_delay);
        self.scale_down_at = self.scale_down_at.max(now + timing.scale_down_delay);
        self.status = ScheduleStatus::Pending;
        self.updated_at = now;
    }

    /// Stop tracking nodes the workload has left. The target is kept, so a
    /// replica moving across several interrupted nodes in turn is covered by
    /// the extra replica it already has.
    pub fn release(&mut self, workload: &WorkloadState) {
        self.tracked_nodes
            .retain(|node| workload.placements.iter().any(|p| p == node));
    }

    /// Push the deadline out by another full delay.
    pub fn rearm(&mut self, now: DateTime<Utc>, timing: &Timing) {
        self.scale_down_at = self.scale_down_at.max(now + timing.scale_down_delay);
        self.status = ScheduleStatus::Pending;
        self.updated_at = now;
    }

    /// Deadline and dwell have both elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.scale_down_at && now >= self.settles_at
    }

    /// Check the invariants a decoded record must satisfy.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.baseline_replicas <= 0 {
            return Err(ModelError::InvalidBaseline {
                workload: self.workload.clone(),
                baseline: self.baseline_replicas,
            });
        }
        let floor = self.baseline_replicas + self.tracked_nodes.len().max(1) as i32;
        if self.target_replicas < floor {
            return Err(ModelError::TargetMismatch {
                workload: self.workload.clone(),
                baseline: self.baseline_replicas,
                target: self.target_replicas,
                tracked: self.tracked_nodes.len(),
            });
        }
        Ok(())
    }
}
