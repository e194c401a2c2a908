//! Orchestration API seam.
//!
//! The controller reads nodes, namespaces, workloads and pods, and writes
//! only replica counts. Everything goes through [`ClusterApi`] so the loop can
//! run against a real cluster ([`KubeCluster`]) or in-process
//! ([`MemoryCluster`]).

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use spotguard_id::WorkloadKey;
use thiserror::Error;

pub(crate) mod k8s;
mod memory;

pub use self::k8s::KubeCluster;
pub use self::memory::MemoryCluster;

/// Errors returned by the orchestration API.
#[derive(Debug, Error, Clone)]
pub enum ClusterError {
    /// The call did not complete within the configured bound.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server could not be reached.
    #[error("API unavailable: {0}")]
    Unavailable(String),

    /// Any other API error.
    #[error("API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// Transient errors are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}

/// A node as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub unschedulable: bool,
}

/// A replicated workload as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    /// Labels on the workload object itself.
    pub labels: BTreeMap<String, String>,
    /// `spec.selector.matchLabels`.
    pub match_labels: BTreeMap<String, String>,
    /// Labels stamped on pods by the pod template.
    pub template_labels: BTreeMap<String, String>,
}

/// A pod as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Node the pod is bound to, if scheduled.
    pub node_name: Option<String>,
    /// Not terminating and not in a terminal phase.
    pub active: bool,
}

/// Orchestration API used by the controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// List every namespace name.
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    /// List workloads in a namespace matching `key=value`.
    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<WorkloadInfo>, ClusterError>;

    /// Fetch one workload regardless of labels.
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<WorkloadInfo>, ClusterError>;

    /// List pods in a namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, ClusterError>;

    /// Set the desired replica count of a workload.
    async fn set_replicas(&self, key: &WorkloadKey, replicas: i32) -> Result<(), ClusterError>;
}

/// Bound an API call; elapsed calls become [`ClusterError::Timeout`].
pub async fn with_timeout<T, F>(after: Duration, op: &'static str, fut: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Timeout { op, after }),
    }
}
