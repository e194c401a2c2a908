//! In-process orchestration API.
//!
//! Holds nodes, deployments and pods in memory and records every replica
//! write. Failures can be injected per call so tests can exercise partial
//! outages. Pods are not reconciled automatically: tests move them around
//! explicitly to model the scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use spotguard_id::WorkloadKey;
use tracing::debug;

use super::{ClusterApi, ClusterError, NodeInfo, PodInfo, WorkloadInfo};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, NodeInfo>,
    namespaces: BTreeSet<String>,
    workloads: BTreeMap<(String, String), WorkloadInfo>,
    pods: Vec<PodInfo>,
    replica_writes: Vec<(WorkloadKey, i32)>,
    failing_namespaces: BTreeSet<String>,
    failing_workloads: BTreeSet<WorkloadKey>,
    pod_counter: u64,
}

/// In-memory cluster for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    fail_nodes: AtomicBool,
    hang_writes: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        self.lock().nodes.insert(
            name.to_string(),
            NodeInfo {
                name: name.to_string(),
                labels: to_map(labels),
                unschedulable: false,
            },
        );
    }

    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.remove(name);
    }

    pub fn cordon(&self, name: &str) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.unschedulable = true;
        }
    }

    pub fn uncordon(&self, name: &str) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.unschedulable = false;
        }
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.insert(namespace.to_string());
    }

    /// Add a deployment whose pods carry `app=<name>`.
    pub fn add_workload(&self, namespace: &str, name: &str, replicas: i32, labels: &[(&str, &str)]) {
        let selector = to_map(&[("app", name)]);
        self.add_workload_with_selector(namespace, name, replicas, labels, selector);
    }

    pub fn add_workload_with_selector(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        labels: &[(&str, &str)],
        selector: BTreeMap<String, String>,
    ) {
        let mut inner = self.lock();
        inner.namespaces.insert(namespace.to_string());
        inner.workloads.insert(
            (namespace.to_string(), name.to_string()),
            WorkloadInfo {
                namespace: namespace.to_string(),
                name: name.to_string(),
                replicas,
                labels: to_map(labels),
                match_labels: selector.clone(),
                template_labels: selector,
            },
        );
    }

    pub fn remove_workload(&self, namespace: &str, name: &str) {
        let mut inner = self.lock();
        inner
            .workloads
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_workload_label(&self, namespace: &str, name: &str, key: &str, value: Option<&str>) {
        let mut inner = self.lock();
        if let Some(w) = inner
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            match value {
                Some(v) => w.labels.insert(key.to_string(), v.to_string()),
                None => w.labels.remove(key),
            };
        }
    }

    /// Schedule a pod of the workload onto a node.
    pub fn add_pod(&self, namespace: &str, workload: &str, node: &str) {
        let mut inner = self.lock();
        let labels = inner
            .workloads
            .get(&(namespace.to_string(), workload.to_string()))
            .map(|w| w.template_labels.clone())
            .unwrap_or_default();
        inner.pod_counter += 1;
        let name = format!("{workload}-{:05}", inner.pod_counter);
        inner.pods.push(PodInfo {
            namespace: namespace.to_string(),
            name,
            labels,
            node_name: Some(node.to_string()),
            active: true,
        });
    }

    /// Remove every pod bound to a node (the node was reclaimed or drained).
    pub fn evict_node(&self, node: &str) {
        self.lock()
            .pods
            .retain(|p| p.node_name.as_deref() != Some(node));
    }

    /// Remove the workload's pods bound to a node.
    pub fn evict_workload_pods(&self, namespace: &str, workload: &str, node: &str) {
        let mut inner = self.lock();
        let selector = inner
            .workloads
            .get(&(namespace.to_string(), workload.to_string()))
            .map(|w| w.template_labels.clone())
            .unwrap_or_default();
        inner.pods.retain(|p| {
            !(p.namespace == namespace
                && p.node_name.as_deref() == Some(node)
                && selector.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
        });
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.lock()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .map(|w| w.replicas)
    }

    /// Every replica write accepted so far, in order.
    pub fn replica_writes(&self) -> Vec<(WorkloadKey, i32)> {
        self.lock().replica_writes.clone()
    }

    pub fn fail_nodes(&self, fail: bool) {
        self.fail_nodes.store(fail, Ordering::SeqCst);
    }

    /// Hang every replica write until the caller's timeout fires.
    pub fn hang_writes(&self, hang: bool) {
        self.hang_writes.store(hang, Ordering::SeqCst);
    }

    pub fn fail_namespace(&self, namespace: &str, fail: bool) {
        let mut inner = self.lock();
        if fail {
            inner.failing_namespaces.insert(namespace.to_string());
        } else {
            inner.failing_namespaces.remove(namespace);
        }
    }

    /// Reject replica writes for one workload.
    pub fn fail_workload(&self, key: &WorkloadKey, fail: bool) {
        let mut inner = self.lock();
        if fail {
            inner.failing_workloads.insert(key.clone());
        } else {
            inner.failing_workloads.remove(key);
        }
    }

    fn check_namespace(inner: &Inner, namespace: &str) -> Result<(), ClusterError> {
        if inner.failing_namespaces.contains(namespace) {
            return Err(ClusterError::Unavailable(format!(
                "namespace {namespace} unavailable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        if self.fail_nodes.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("node listing failed".into()));
        }
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.lock().namespaces.iter().cloned().collect())
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<WorkloadInfo>, ClusterError> {
        let inner = self.lock();
        Self::check_namespace(&inner, namespace)?;
        let (key, value) = label_selector
            .split_once('=')
            .ok_or_else(|| ClusterError::Api(format!("bad selector {label_selector}")))?;
        Ok(inner
            .workloads
            .values()
            .filter(|w| w.namespace == namespace)
            .filter(|w| w.labels.get(key).is_some_and(|v| v == value))
            .cloned()
            .collect())
    }

    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<WorkloadInfo>, ClusterError> {
        let inner = self.lock();
        Self::check_namespace(&inner, key.namespace().as_str())?;
        Ok(inner
            .workloads
            .get(&(key.namespace().to_string(), key.name().to_string()))
            .cloned())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, ClusterError> {
        let inner = self.lock();
        Self::check_namespace(&inner, namespace)?;
        Ok(inner
            .pods
            .iter()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn set_replicas(&self, key: &WorkloadKey, replicas: i32) -> Result<(), ClusterError> {
        if self.hang_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.failing_workloads.contains(key) {
            return Err(ClusterError::Unavailable(format!("write to {key} failed")));
        }
        let Some(workload) = inner
            .workloads
            .get_mut(&(key.namespace().to_string(), key.name().to_string()))
        else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        workload.replicas = replicas;
        inner.replica_writes.push((key.clone(), replicas));
        debug!(workload = %key, replicas, "[MEMORY] Replicas set");
        Ok(())
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
