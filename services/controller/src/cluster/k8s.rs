//! Kubernetes implementation of the orchestration API.
//!
//! Workloads are `apps/v1` Deployments. Replica changes are merge patches of
//! `spec.replicas`, so they are absolute and safe to repeat.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use spotguard_id::WorkloadKey;
use tracing::debug;

use super::{ClusterApi, ClusterError, NodeInfo, PodInfo, WorkloadInfo};

/// Field manager recorded on replica patches.
pub const FIELD_MANAGER: &str = "spot-guard";

/// Orchestration API backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(map_err)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await.map_err(map_err)?;

        Ok(nodes
            .items
            .into_iter()
            .map(|node| NodeInfo {
                name: node.name_any(),
                labels: node.labels().clone(),
                unschedulable: node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false),
            })
            .collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await.map_err(map_err)?;
        Ok(namespaces.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<WorkloadInfo>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let deployments = api.list(&params).await.map_err(map_err)?;

        debug!(
            namespace,
            label_selector,
            count = deployments.items.len(),
            "Listed deployments"
        );

        Ok(deployments
            .items
            .into_iter()
            .map(|d| workload_info(namespace, d))
            .collect())
    }

    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<WorkloadInfo>, ClusterError> {
        let namespace = key.namespace().as_str();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api.get_opt(key.name().as_str()).await.map_err(map_err)?;
        Ok(deployment.map(|d| workload_info(namespace, d)))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await.map_err(map_err)?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let phase = pod.status.as_ref().and_then(|s| s.phase.clone());
                let terminal = matches!(phase.as_deref(), Some("Succeeded") | Some("Failed"));
                PodInfo {
                    namespace: namespace.to_string(),
                    name: pod.name_any(),
                    labels: pod.labels().clone(),
                    node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                    active: pod.metadata.deletion_timestamp.is_none() && !terminal,
                }
            })
            .collect())
    }

    async fn set_replicas(&self, key: &WorkloadKey, replicas: i32) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), key.namespace().as_str());
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            key.name().as_str(),
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

fn workload_info(namespace: &str, deployment: Deployment) -> WorkloadInfo {
    let labels = deployment.labels().clone();
    let name = deployment.name_any();
    let spec = deployment.spec.unwrap_or_default();
    let match_labels = spec.selector.match_labels.unwrap_or_default();
    let template_labels = spec
        .template
        .metadata
        .and_then(|m| m.labels)
        .unwrap_or_else(BTreeMap::new);

    WorkloadInfo {
        namespace: namespace.to_string(),
        name,
        // An unset replica count defaults to 1 on the API server.
        replicas: spec.replicas.unwrap_or(1),
        labels,
        match_labels,
        template_labels,
    }
}

/// Map kube errors into the controller's taxonomy.
pub(crate) fn map_err(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::NotFound(response.message),
            409 => ClusterError::Conflict(response.message),
            429 | 500..=599 => ClusterError::Unavailable(response.message),
            _ => ClusterError::Api(response.message),
        },
        kube::Error::HyperError(e) => ClusterError::Unavailable(e.to_string()),
        kube::Error::Service(e) => ClusterError::Unavailable(e.to_string()),
        other => ClusterError::Api(other.to_string()),
    }
}
