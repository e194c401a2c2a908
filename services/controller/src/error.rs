//! Error taxonomy for reconciliation.
//!
//! - Cycle-level errors ([`ReconcileError`]) abort the cycle before any
//!   mutation: without reliable node or schedule state the controller
//!   declines to act.
//! - Workload-level errors ([`WorkloadError`]) are isolated to one workload
//!   and retried on the next cycle.

use spotguard_id::WorkloadKey;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::schedule::StoreError;

/// Errors that abort a whole cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Nodes could not be listed.
    #[error("cannot list nodes: {0}")]
    NodesUnavailable(#[source] ClusterError),

    /// Namespaces could not be discovered.
    #[error("cannot list namespaces: {0}")]
    NamespacesUnavailable(#[source] ClusterError),

    /// The schedule store could not be read.
    #[error("schedule store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl ReconcileError {
    /// Fatal conditions block all mutations until they clear.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NodesUnavailable(_) | Self::StoreUnavailable(_))
    }
}

/// Errors confined to one workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("{key}: {source}")]
    Cluster {
        key: WorkloadKey,
        #[source]
        source: ClusterError,
    },

    #[error("{key}: {source}")]
    Store {
        key: WorkloadKey,
        #[source]
        source: StoreError,
    },

    /// The schedule changed between decision and apply.
    #[error("{0}: schedule changed since it was read")]
    Superseded(WorkloadKey),
}

impl WorkloadError {
    pub fn key(&self) -> &WorkloadKey {
        match self {
            Self::Cluster { key, .. } | Self::Store { key, .. } | Self::Superseded(key) => key,
        }
    }

    /// Permanent errors (the workload is gone) are not worth escalating.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cluster { source, .. } => source.is_transient(),
            Self::Store { .. } | Self::Superseded(_) => true,
        }
    }
}
