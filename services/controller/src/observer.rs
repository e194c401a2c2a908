//! Cluster state observer.
//!
//! Reads nodes, protected workloads and the nodes their pods occupy. Pure
//! read: no decisions are made here.
//!
//! Failure handling:
//! - Node listing failure aborts the observation. Node state is never guessed.
//! - A namespace whose workloads or pods cannot be listed is recorded as
//!   failed and skipped; other namespaces proceed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use spotguard_id::WorkloadKey;
use spotguard_reconcile::{CapacityClass, ClusterNodes, NodeState};
use tracing::{debug, instrument, warn};

use crate::cluster::{with_timeout, ClusterApi, ClusterError, PodInfo, WorkloadInfo};
use crate::error::ReconcileError;
use crate::selector::{resolve_pod_selector, NamespacePolicy, PodSelector, ProtectedLabel};

/// A workload together with where its pods run.
#[derive(Debug, Clone)]
pub struct ObservedWorkload {
    pub key: WorkloadKey,
    pub info: WorkloadInfo,
    pub selector: Option<PodSelector>,
    /// Node of each active pod matched by the selector.
    pub placements: Vec<String>,
}

/// What one observation saw of a single workload.
#[derive(Debug, Clone, Copy)]
pub enum Seen<'a> {
    Present(&'a ObservedWorkload),
    Missing,
    Unknown,
}

/// Cluster state for one cycle.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: ClusterNodes,
    pub workloads: BTreeMap<WorkloadKey, ObservedWorkload>,
    /// Namespaces that could not be read this cycle.
    pub failed_namespaces: BTreeSet<String>,
    /// Tracked workloads that were fetched individually and do not exist.
    pub missing: BTreeSet<WorkloadKey>,
}

impl ClusterSnapshot {
    pub fn lookup(&self, key: &WorkloadKey) -> Seen<'_> {
        if let Some(workload) = self.workloads.get(key) {
            return Seen::Present(workload);
        }
        if self.missing.contains(key) {
            return Seen::Missing;
        }
        Seen::Unknown
    }
}

/// Reads cluster state through the orchestration API.
pub struct ClusterObserver {
    cluster: Arc<dyn ClusterApi>,
    api_timeout: Duration,
}

impl ClusterObserver {
    pub fn new(cluster: Arc<dyn ClusterApi>, api_timeout: Duration) -> Self {
        Self {
            cluster,
            api_timeout,
        }
    }

    /// Read nodes only.
    pub async fn nodes(&self) -> Result<ClusterNodes, ClusterError> {
        let nodes = with_timeout(self.api_timeout, "list_nodes", self.cluster.list_nodes()).await?;
        Ok(ClusterNodes::new(nodes.into_iter().map(|n| NodeState {
            capacity_class: CapacityClass::from_labels(&n.labels),
            scheduling_disabled: n.unschedulable,
            name: n.name,
        })))
    }

    /// Observe the cluster.
    ///
    /// With `label` set, every workload carrying it in the namespaces the
    /// policy targets is listed. Each key in `tracked` that the listing did
    /// not return is then fetched by name, so workloads that lost their label
    /// or left the targeted namespaces are still seen.
    #[instrument(skip_all, fields(tracked = tracked.len()))]
    pub async fn observe(
        &self,
        policy: &NamespacePolicy,
        label: Option<&ProtectedLabel>,
        tracked: &BTreeSet<WorkloadKey>,
    ) -> Result<ClusterSnapshot, ReconcileError> {
        let nodes = self.nodes().await.map_err(ReconcileError::NodesUnavailable)?;

        let mut snapshot = ClusterSnapshot {
            nodes,
            ..Default::default()
        };
        let mut found: Vec<WorkloadInfo> = Vec::new();
        let mut listed: BTreeSet<String> = BTreeSet::new();

        if let Some(label) = label {
            let namespaces = self
                .target_namespaces(policy)
                .await
                .map_err(ReconcileError::NamespacesUnavailable)?;
            let selector = label.selector();
            for namespace in namespaces {
                match with_timeout(
                    self.api_timeout,
                    "list_workloads",
                    self.cluster.list_workloads(&namespace, &selector),
                )
                .await
                {
                    Ok(workloads) => {
                        found.extend(workloads);
                        listed.insert(namespace);
                    }
                    Err(e) => {
                        warn!(namespace = %namespace, error = %e, "Failed to list workloads, skipping namespace");
                        snapshot.failed_namespaces.insert(namespace);
                    }
                }
            }
        }

        for key in tracked {
            let namespace = key.namespace().as_str();
            if snapshot.failed_namespaces.contains(namespace) {
                continue;
            }
            let listed_here = listed.contains(namespace)
                && found
                    .iter()
                    .any(|w| w.namespace == namespace && w.name == key.name().as_str());
            if listed_here {
                continue;
            }
            match with_timeout(self.api_timeout, "get_workload", self.cluster.get_workload(key)).await {
                Ok(Some(info)) => found.push(info),
                Ok(None) => {
                    snapshot.missing.insert(key.clone());
                }
                Err(e) => {
                    warn!(workload = %key, error = %e, "Failed to fetch tracked workload");
                }
            }
        }

        self.attach_placements(&mut snapshot, found).await;

        debug!(
            nodes = snapshot.nodes.len(),
            cordoned = snapshot.nodes.disabled_count(),
            workloads = snapshot.workloads.len(),
            failed_namespaces = snapshot.failed_namespaces.len(),
            "Observed cluster state"
        );

        Ok(snapshot)
    }

    async fn target_namespaces(&self, policy: &NamespacePolicy) -> Result<Vec<String>, ClusterError> {
        if let Some(explicit) = policy.explicit_namespaces() {
            return Ok(explicit.iter().cloned().collect());
        }
        let all = with_timeout(
            self.api_timeout,
            "list_namespaces",
            self.cluster.list_namespaces(),
        )
        .await?;
        Ok(all.into_iter().filter(|ns| policy.allows(ns)).collect())
    }

    async fn attach_placements(&self, snapshot: &mut ClusterSnapshot, found: Vec<WorkloadInfo>) {
        let namespaces: BTreeSet<String> = found.iter().map(|w| w.namespace.clone()).collect();
        let mut pods: BTreeMap<String, Vec<PodInfo>> = BTreeMap::new();

        for namespace in namespaces {
            match with_timeout(self.api_timeout, "list_pods", self.cluster.list_pods(&namespace)).await {
                Ok(list) => {
                    pods.insert(namespace, list);
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to list pods, skipping namespace");
                    snapshot.failed_namespaces.insert(namespace);
                }
            }
        }

        for info in found {
            let Some(namespace_pods) = pods.get(&info.namespace) else {
                continue;
            };
            let key = match WorkloadKey::new(&info.namespace, &info.name) {
                Ok(key) => key,
                Err(e) => {
                    warn!(namespace = %info.namespace, workload = %info.name, error = %e, "Invalid workload identity");
                    continue;
                }
            };
            let selector = resolve_pod_selector(&info);
            let placements = match &selector {
                Some(selector) => namespace_pods
                    .iter()
                    .filter(|p| p.active && selector.matches(&p.labels))
                    .filter_map(|p| p.node_name.clone())
                    .collect(),
                None => Vec::new(),
            };
            snapshot.workloads.insert(
                key.clone(),
                ObservedWorkload {
                    key,
                    info,
                    selector,
                    placements,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    const LABEL: &str = "spot-guard.io/protected=true";

    fn cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1", &[("karpenter.sh/capacity-type", "spot")]);
        cluster.add_node("n2", &[]);
        cluster.add_workload("qa", "web", 1, &[("spot-guard.io/protected", "true")]);
        cluster.add_workload("prod", "api", 1, &[("spot-guard.io/protected", "true")]);
        cluster.add_workload("qa", "batch", 1, &[]);
        cluster.add_pod("qa", "web", "n1");
        cluster.add_pod("prod", "api", "n2");
        cluster
    }

    fn observer(cluster: Arc<MemoryCluster>) -> ClusterObserver {
        ClusterObserver::new(cluster, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_observe_placements() {
        let cluster = cluster();
        let label: ProtectedLabel = LABEL.parse().unwrap();
        let snapshot = observer(cluster)
            .observe(&NamespacePolicy::All, Some(&label), &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(snapshot.workloads.len(), 2);
        let web = &snapshot.workloads[&WorkloadKey::parse("qa/web").unwrap()];
        assert_eq!(web.placements, vec!["n1".to_string()]);
        assert_eq!(
            snapshot.nodes.get("n1").unwrap().capacity_class,
            CapacityClass::Interruptible
        );
    }

    #[tokio::test]
    async fn test_node_failure_aborts() {
        let cluster = cluster();
        cluster.fail_nodes(true);
        let label: ProtectedLabel = LABEL.parse().unwrap();
        let result = observer(cluster)
            .observe(&NamespacePolicy::All, Some(&label), &BTreeSet::new())
            .await;
        assert!(matches!(result, Err(ReconcileError::NodesUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failed_namespace_is_skipped() {
        let cluster = cluster();
        cluster.fail_namespace("prod", true);
        let label: ProtectedLabel = LABEL.parse().unwrap();
        let snapshot = observer(cluster)
            .observe(&NamespacePolicy::All, Some(&label), &BTreeSet::new())
            .await
            .unwrap();

        assert!(snapshot.failed_namespaces.contains("prod"));
        assert_eq!(snapshot.workloads.len(), 1);
        assert!(matches!(
            snapshot.lookup(&WorkloadKey::parse("prod/api").unwrap()),
            Seen::Unknown
        ));
    }

    #[tokio::test]
    async fn test_tracked_workload_without_label_is_fetched() {
        let cluster = cluster();
        let label: ProtectedLabel = LABEL.parse().unwrap();
        let tracked: BTreeSet<_> = [
            WorkloadKey::parse("qa/batch").unwrap(),
            WorkloadKey::parse("qa/deleted").unwrap(),
        ]
        .into();
        let snapshot = observer(cluster)
            .observe(&NamespacePolicy::All, Some(&label), &tracked)
            .await
            .unwrap();

        assert!(matches!(
            snapshot.lookup(&WorkloadKey::parse("qa/batch").unwrap()),
            Seen::Present(_)
        ));
        assert!(matches!(
            snapshot.lookup(&WorkloadKey::parse("qa/deleted").unwrap()),
            Seen::Missing
        ));
    }

    #[tokio::test]
    async fn test_recovery_observation_reads_tracked_only() {
        let cluster = cluster();
        let tracked: BTreeSet<_> = [WorkloadKey::parse("qa/web").unwrap()].into();
        let snapshot = observer(cluster)
            .observe(&NamespacePolicy::All, None, &tracked)
            .await
            .unwrap();
        assert_eq!(snapshot.workloads.len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_pods_leave_no_placements() {
        let cluster = cluster();
        cluster.evict_workload_pods("qa", "web", "n1");
        let label: ProtectedLabel = LABEL.parse().unwrap();
        let snapshot = observer(cluster)
            .observe(&NamespacePolicy::All, Some(&label), &BTreeSet::new())
            .await
            .unwrap();
        let web = &snapshot.workloads[&WorkloadKey::parse("qa/web").unwrap()];
        assert!(web.placements.is_empty());
    }
}
