//! Schedule store.
//!
//! Durable mapping from workload identity to [`ScaleSchedule`], layered over
//! a plain string record substrate ([`RecordStore`]):
//!
//! - [`ConfigMapRecords`]: one ConfigMap entry per schedule (in-cluster)
//! - [`SqliteRecords`]: local SQLite file
//! - [`MemoryRecords`]: in-process, for tests
//!
//! Read-modify-write of one key is a critical section: callers hold the
//! guard returned by [`ScheduleStore::lock`] across read, decide and write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spotguard_id::WorkloadKey;
use spotguard_reconcile::{ModelError, ScaleSchedule};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error};

use crate::cluster::ClusterError;

mod configmap;
mod memory;
mod sqlite;

pub use configmap::ConfigMapRecords;
pub use memory::MemoryRecords;
pub use sqlite::SqliteRecords;

/// Result of reading every record.
#[derive(Debug, Default, Clone)]
pub struct Listing {
    pub schedules: Vec<ScaleSchedule>,
    /// Record keys that could not be decoded.
    pub corrupt: Vec<String>,
}

/// Errors from the schedule store and its substrates.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid schedule: {0}")]
    Invalid(#[from] ModelError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// String key/value substrate backing the schedule store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put_record(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting an absent key succeeds.
    async fn delete_record(&self, key: &str) -> Result<(), StoreError>;

    async fn list_records(&self) -> Result<Vec<(String, String)>, StoreError>;
}

/// Typed schedule persistence with per-key locking.
pub struct ScheduleStore {
    records: Arc<dyn RecordStore>,
    timeout: Duration,
    locks: Mutex<HashMap<WorkloadKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScheduleStore {
    pub fn new(records: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self {
            records,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the critical section for one workload.
    pub async fn lock(&self, key: &WorkloadKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds.
    pub fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub async fn get(&self, key: &WorkloadKey) -> Result<Option<ScaleSchedule>, StoreError> {
        let record_key = key.record_key();
        let raw = self
            .bounded("get", self.records.get_record(&record_key))
            .await?;
        raw.map(|raw| decode(&record_key, &raw)).transpose()
    }

    /// Upsert a schedule.
    pub async fn put(&self, schedule: &ScaleSchedule) -> Result<(), StoreError> {
        schedule.validate()?;
        let record_key = schedule.workload.record_key();
        let raw = serde_json::to_string(schedule)?;
        self.bounded("put", self.records.put_record(&record_key, &raw))
            .await?;
        debug!(
            workload = %schedule.workload,
            status = %schedule.status,
            scale_down_at = %schedule.scale_down_at,
            "Schedule persisted"
        );
        Ok(())
    }

    pub async fn delete(&self, key: &WorkloadKey) -> Result<(), StoreError> {
        self.bounded("delete", self.records.delete_record(&key.record_key()))
            .await?;
        debug!(workload = %key, "Schedule deleted");
        Ok(())
    }

    /// Every persisted schedule. Unreadable records are reported in the
    /// listing and left in place for an operator to inspect.
    pub async fn list_all(&self) -> Result<Listing, StoreError> {
        let records = self.bounded("list", self.records.list_records()).await?;
        let mut listing = Listing::default();
        for (key, raw) in records {
            match decode(&key, &raw) {
                Ok(schedule) => listing.schedules.push(schedule),
                Err(e) => {
                    error!(record = %key, error = %e, "Unreadable schedule record, workload may stay scaled up");
                    listing.corrupt.push(key);
                }
            }
        }
        Ok(listing)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }
}

fn decode(record_key: &str, raw: &str) -> Result<ScaleSchedule, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: record_key.to_string(),
        reason,
    };
    let workload = WorkloadKey::from_record_key(record_key).map_err(|e| corrupt(e.to_string()))?;
    let schedule: ScaleSchedule = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    if schedule.workload != workload {
        return Err(corrupt(format!(
            "record holds schedule for {}",
            schedule.workload
        )));
    }
    schedule.validate().map_err(|e| corrupt(e.to_string()))?;
    Ok(schedule)
}
