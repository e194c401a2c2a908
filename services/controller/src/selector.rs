//! Workload selection.
//!
//! A workload is protected when it carries the protection label, its
//! namespace passes the targeting policy, and its pods can be found through
//! one of the conventional selector keys.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::cluster::WorkloadInfo;

/// Selector keys tried in order to find a workload's pods. First match wins.
pub const SELECTOR_KEYS: &[&str] = &[
    "app",
    "component",
    "name",
    "app.kubernetes.io/name",
    "app.kubernetes.io/component",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown namespace mode '{0}' (expected whitelist, blacklist or all)")]
    UnknownMode(String),

    #[error("protected label must be key=value, got '{0}'")]
    InvalidLabel(String),
}

// =============================================================================
// Namespace Policy
// =============================================================================

/// Which namespaces are targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespacePolicy {
    /// Only the listed namespaces. An empty set selects nothing.
    Whitelist(BTreeSet<String>),
    /// Every namespace except the listed ones.
    Blacklist(BTreeSet<String>),
    /// Every namespace.
    All,
}

impl NamespacePolicy {
    /// Build a policy from a mode name and a namespace set.
    pub fn from_mode(mode: &str, namespaces: BTreeSet<String>) -> Result<Self, SelectorError> {
        match mode.trim().to_lowercase().as_str() {
            "whitelist" => Ok(Self::Whitelist(namespaces)),
            "blacklist" => Ok(Self::Blacklist(namespaces)),
            "all" => Ok(Self::All),
            other => Err(SelectorError::UnknownMode(other.to_string())),
        }
    }

    pub fn allows(&self, namespace: &str) -> bool {
        match self {
            Self::Whitelist(set) => set.contains(namespace),
            Self::Blacklist(set) => !set.contains(namespace),
            Self::All => true,
        }
    }

    /// Namespaces to list directly, or `None` when every namespace must be
    /// discovered first.
    pub fn explicit_namespaces(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Whitelist(set) => Some(set),
            Self::Blacklist(_) | Self::All => None,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Whitelist(_) => "whitelist",
            Self::Blacklist(_) => "blacklist",
            Self::All => "all",
        }
    }
}

// =============================================================================
// Protected Label
// =============================================================================

/// Default protection label key.
pub const DEFAULT_LABEL_KEY: &str = "spot-guard.io/protected";

/// Default protection label value.
pub const DEFAULT_LABEL_VALUE: &str = "true";

/// Label (`key=value`) that opts a workload into protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedLabel {
    pub key: String,
    pub value: String,
}

impl ProtectedLabel {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }

    /// Label selector string for list calls.
    pub fn selector(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl Default for ProtectedLabel {
    fn default() -> Self {
        Self {
            key: DEFAULT_LABEL_KEY.to_string(),
            value: DEFAULT_LABEL_VALUE.to_string(),
        }
    }
}

impl FromStr for ProtectedLabel {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((key, value)) = s.split_once('=') else {
            return Err(SelectorError::InvalidLabel(s.to_string()));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() || value.contains('=') {
            return Err(SelectorError::InvalidLabel(s.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

impl std::fmt::Display for ProtectedLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// =============================================================================
// Pod Selector
// =============================================================================

/// Single `key=value` used to find a workload's pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSelector {
    pub key: String,
    pub value: String,
}

impl PodSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }
}

/// Resolve the pod selector of a workload.
///
/// Keys are tried in [`SELECTOR_KEYS`] order, first in `matchLabels` and then
/// in the pod template labels.
pub fn resolve_pod_selector(workload: &WorkloadInfo) -> Option<PodSelector> {
    [&workload.match_labels, &workload.template_labels]
        .into_iter()
        .find_map(|labels| {
            SELECTOR_KEYS.iter().find_map(|key| {
                labels.get(*key).map(|value| PodSelector {
                    key: key.to_string(),
                    value: value.clone(),
                })
            })
        })
}

// =============================================================================
// Selection
// =============================================================================

/// Outcome of evaluating one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    MissingLabel,
    NamespaceExcluded,
    NoPodSelector,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Filters observed workloads down to the protected set.
#[derive(Debug, Clone)]
pub struct WorkloadSelector {
    policy: NamespacePolicy,
    label: ProtectedLabel,
}

impl Default for WorkloadSelector {
    fn default() -> Self {
        Self::new(NamespacePolicy::All, ProtectedLabel::default())
    }
}

impl WorkloadSelector {
    pub fn new(policy: NamespacePolicy, label: ProtectedLabel) -> Self {
        Self { policy, label }
    }

    pub fn policy(&self) -> &NamespacePolicy {
        &self.policy
    }

    pub fn label(&self) -> &ProtectedLabel {
        &self.label
    }

    pub fn evaluate(&self, workload: &WorkloadInfo, selector: Option<&PodSelector>) -> Eligibility {
        if !self.label.matches(&workload.labels) {
            return Eligibility::MissingLabel;
        }
        if !self.policy.allows(&workload.namespace) {
            return Eligibility::NamespaceExcluded;
        }
        if selector.is_none() {
            return Eligibility::NoPodSelector;
        }
        Eligibility::Eligible
    }

    /// Keep only eligible workloads. Unresolvable selectors are skipped with
    /// a warning.
    pub fn select<'a, T, F>(&self, workloads: &'a [T], view: F) -> Vec<&'a T>
    where
        F: Fn(&T) -> (&WorkloadInfo, Option<&PodSelector>),
    {
        workloads
            .iter()
            .filter(|w| {
                let (info, selector) = view(w);
                match self.evaluate(info, selector) {
                    Eligibility::Eligible => true,
                    Eligibility::NoPodSelector => {
                        warn!(
                            namespace = %info.namespace,
                            workload = %info.name,
                            tried = ?SELECTOR_KEYS,
                            "No pod selector key found, skipping workload"
                        );
                        false
                    }
                    Eligibility::MissingLabel | Eligibility::NamespaceExcluded => false,
                }
            })
            .collect()
    }
}
