//! Configuration for the controller.
//!
//! Read once at startup from `SPOTGUARD_*` environment variables. Invalid
//! values are startup errors.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use spotguard_reconcile::{
    Timing, DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_SCALE_DOWN_DELAY_SECS, DEFAULT_SCALE_UP_DELAY_SECS,
    MAX_DELAY_SECS,
};

use crate::reconciler::ReconcilerConfig;
use crate::selector::{NamespacePolicy, ProtectedLabel, WorkloadSelector};

const DEFAULT_API_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONCURRENCY: usize = 8;
const DEFAULT_CONFIGMAP_NAME: &str = "spot-guard-schedules";
const DEFAULT_CONTROLLER_NAMESPACE: &str = "spot-guard";
const DEFAULT_STATE_PATH: &str = "/var/lib/spot-guard/schedules.db";

/// Where schedules are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleBackend {
    /// One key per workload in a ConfigMap.
    ConfigMap { namespace: String, name: String },
    /// Local SQLite file. Only durable when the path is on a persistent volume.
    Sqlite { path: PathBuf },
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace_policy: NamespacePolicy,

    /// Label that opts a workload into protection.
    pub protected_label: ProtectedLabel,

    pub timing: Timing,

    /// Reconciliation loop period.
    pub check_interval: Duration,

    /// Bound on every external call.
    pub api_timeout: Duration,

    pub max_concurrency: usize,

    pub schedule_backend: ScheduleBackend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mode = var("SPOTGUARD_NAMESPACE_MODE").unwrap_or_else(|| "all".to_string());
        let namespaces: BTreeSet<String> = var("SPOTGUARD_TARGET_NAMESPACES")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let namespace_policy = NamespacePolicy::from_mode(&mode, namespaces)
            .context("invalid SPOTGUARD_NAMESPACE_MODE")?;

        let protected_label = match var("SPOTGUARD_PROTECTED_LABEL") {
            Some(s) => s.parse().context("invalid SPOTGUARD_PROTECTED_LABEL")?,
            None => ProtectedLabel::default(),
        };

        let scale_up = parse_delay(
            &var,
            "SPOTGUARD_SCALE_UP_DELAY_SECS",
            DEFAULT_SCALE_UP_DELAY_SECS,
        )?;
        let scale_down = parse_delay(
            &var,
            "SPOTGUARD_SCALE_DOWN_DELAY_SECS",
            DEFAULT_SCALE_DOWN_DELAY_SECS,
        )?;
        let check_interval = parse_u64(
            &var,
            "SPOTGUARD_CHECK_INTERVAL_SECS",
            DEFAULT_CHECK_INTERVAL_SECS,
        )?
        .max(1);
        let api_timeout =
            parse_u64(&var, "SPOTGUARD_API_TIMEOUT_SECS", DEFAULT_API_TIMEOUT_SECS)?.max(1);
        let max_concurrency = parse_u64(
            &var,
            "SPOTGUARD_MAX_CONCURRENCY",
            DEFAULT_MAX_CONCURRENCY as u64,
        )?
        .max(1) as usize;

        let backend = var("SPOTGUARD_SCHEDULE_BACKEND").unwrap_or_else(|| "configmap".to_string());
        let schedule_backend = match backend.to_lowercase().as_str() {
            "configmap" => ScheduleBackend::ConfigMap {
                namespace: var("SPOTGUARD_CONTROLLER_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_CONTROLLER_NAMESPACE.to_string()),
                name: var("SPOTGUARD_SCHEDULE_CONFIGMAP")
                    .unwrap_or_else(|| DEFAULT_CONFIGMAP_NAME.to_string()),
            },
            "sqlite" => ScheduleBackend::Sqlite {
                path: var("SPOTGUARD_STATE_PATH")
                    .unwrap_or_else(|| DEFAULT_STATE_PATH.to_string())
                    .into(),
            },
            other => anyhow::bail!(
                "invalid SPOTGUARD_SCHEDULE_BACKEND '{other}' (expected configmap or sqlite)"
            ),
        };

        let log_level = var("SPOTGUARD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            namespace_policy,
            protected_label,
            timing: Timing::from_secs(scale_up, scale_down),
            check_interval: Duration::from_secs(check_interval),
            api_timeout: Duration::from_secs(api_timeout),
            max_concurrency,
            schedule_backend,
            log_level,
        })
    }

    /// Reconciler settings derived from this configuration.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            selector: WorkloadSelector::new(
                self.namespace_policy.clone(),
                self.protected_label.clone(),
            ),
            timing: self.timing,
            api_timeout: self.api_timeout,
            max_concurrency: self.max_concurrency,
            ..ReconcilerConfig::default()
        }
    }
}

fn parse_u64<F>(var: &F, name: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(s) => s
            .parse()
            .with_context(|| format!("invalid {name}: '{s}' is not a non-negative integer")),
        None => Ok(default),
    }
}

fn parse_delay<F>(var: &F, name: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_u64(var, name, default)?;
    if secs > MAX_DELAY_SECS {
        anyhow::bail!("invalid {name}: {secs} exceeds the maximum of {MAX_DELAY_SECS} seconds");
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.namespace_policy, NamespacePolicy::All);
        assert_eq!(config.protected_label.to_string(), "spot-guard.io/protected=true");
        assert_eq!(config.timing, Timing::from_secs(60, 300));
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.api_timeout, Duration::from_secs(10));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(
            config.schedule_backend,
            ScheduleBackend::ConfigMap {
                namespace: "spot-guard".to_string(),
                name: "spot-guard-schedules".to_string(),
            }
        );
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_whitelist_namespaces() {
        let config = load(&[
            ("SPOTGUARD_NAMESPACE_MODE", "whitelist"),
            ("SPOTGUARD_TARGET_NAMESPACES", "qa, dev,,"),
        ])
        .unwrap();
        assert!(config.namespace_policy.allows("qa"));
        assert!(config.namespace_policy.allows("dev"));
        assert!(!config.namespace_policy.allows("prod"));
    }

    #[test]
    fn test_check_interval_floor() {
        let config = load(&[("SPOTGUARD_CHECK_INTERVAL_SECS", "0")]).unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_sqlite_backend() {
        let config = load(&[
            ("SPOTGUARD_SCHEDULE_BACKEND", "sqlite"),
            ("SPOTGUARD_STATE_PATH", "/data/s.db"),
        ])
        .unwrap();
        assert_eq!(
            config.schedule_backend,
            ScheduleBackend::Sqlite {
                path: PathBuf::from("/data/s.db")
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("SPOTGUARD_NAMESPACE_MODE", "some")]).is_err());
        assert!(load(&[("SPOTGUARD_PROTECTED_LABEL", "novalue")]).is_err());
        assert!(load(&[("SPOTGUARD_SCALE_DOWN_DELAY_SECS", "-5")]).is_err());
        assert!(load(&[("SPOTGUARD_SCHEDULE_BACKEND", "etcd")]).is_err());
    }

    #[test]
    fn test_delay_upper_bound() {
        let max = MAX_DELAY_SECS.to_string();
        assert!(load(&[("SPOTGUARD_SCALE_DOWN_DELAY_SECS", max.as_str())]).is_ok());

        let over = (MAX_DELAY_SECS + 1).to_string();
        assert!(load(&[("SPOTGUARD_SCALE_DOWN_DELAY_SECS", over.as_str())]).is_err());
        assert!(load(&[("SPOTGUARD_SCALE_UP_DELAY_SECS", "18446744073709551615")]).is_err());
    }

    #[test]
    fn test_reconciler_config_carries_settings() {
        let config = load(&[
            ("SPOTGUARD_SCALE_DOWN_DELAY_SECS", "120"),
            ("SPOTGUARD_MAX_CONCURRENCY", "2"),
        ])
        .unwrap();
        let rc = config.reconciler_config();
        assert_eq!(rc.timing.scale_down_delay, chrono::TimeDelta::seconds(120));
        assert_eq!(rc.max_concurrency, 2);
    }
}
