//! ConfigMap record substrate.
//!
//! Every schedule is one `data` entry of a single ConfigMap in the
//! controller's namespace. Writes replace the whole object guarded by its
//! `resourceVersion`, so a concurrent writer surfaces as a conflict and the
//! write is retried against the fresh object.
//!
//! Writes from this process are serialized behind one lock. Concurrent
//! applies for different workloads all touch the same object, and without
//! the lock they would conflict with each other on every cycle.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{RecordStore, StoreError};
use crate::cluster::{k8s::map_err, ClusterError};

/// Attempts per write when the ConfigMap changed underneath us.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Pause before retrying a conflicted write, multiplied by the attempt.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(25);

/// Label stamped on the ConfigMap for discoverability.
const MANAGED_BY: (&str, &str) = ("app.kubernetes.io/managed-by", "spot-guard");

pub struct ConfigMapRecords {
    api: Api<ConfigMap>,
    name: String,
    write_lock: Mutex<()>,
}

impl ConfigMapRecords {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    async fn fetch(&self) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self.api.get_opt(&self.name).await.map_err(map_err)?)
    }

    /// Apply `edit` to the data map and write it back.
    async fn modify<F>(&self, edit: F) -> Result<(), StoreError>
    where
        F: Fn(&mut BTreeMap<String, String>) -> bool,
    {
        write_exclusive(&self.write_lock, &self.name, || self.write_once(&edit)).await
    }

    /// One read-edit-replace round. A stale `resourceVersion` comes back as
    /// a conflict.
    async fn write_once<F>(&self, edit: &F) -> Result<(), StoreError>
    where
        F: Fn(&mut BTreeMap<String, String>) -> bool,
    {
        let result = match self.fetch().await? {
            Some(mut cm) => {
                let data = cm.data.get_or_insert_with(BTreeMap::new);
                if !edit(data) {
                    return Ok(());
                }
                self.api
                    .replace(&self.name, &PostParams::default(), &cm)
                    .await
                    .map(|_| ())
            }
            None => {
                let mut data = BTreeMap::new();
                if !edit(&mut data) {
                    return Ok(());
                }
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        labels: Some(BTreeMap::from([(
                            MANAGED_BY.0.to_string(),
                            MANAGED_BY.1.to_string(),
                        )])),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.api
                    .create(&PostParams::default(), &cm)
                    .await
                    .map(|_| ())
            }
        };
        Ok(result.map_err(map_err)?)
    }
}

/// Run `write` under `lock`, retrying conflicts with a linear backoff.
async fn write_exclusive<F, Fut>(
    lock: &Mutex<()>,
    configmap: &str,
    mut write: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let _guard = lock.lock().await;
    let mut attempt = 1;
    loop {
        match write().await {
            Err(StoreError::Cluster(ClusterError::Conflict(message))) => {
                if attempt >= MAX_CONFLICT_RETRIES {
                    warn!(configmap, attempt, "ConfigMap write kept conflicting");
                    return Err(ClusterError::Conflict(message).into());
                }
                debug!(configmap, attempt, "ConfigMap write conflict, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl RecordStore for ConfigMapRecords {
    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .fetch()
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(key)))
    }

    async fn put_record(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(|data| {
            if data.get(key).map(String::as_str) == Some(value) {
                return false;
            }
            data.insert(key.to_string(), value.to_string());
            true
        })
        .await
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        self.modify(|data| data.remove(key).is_some()).await
    }

    async fn list_records(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .fetch()
            .await?
            .and_then(|cm| cm.data)
            .map(|data| data.into_iter().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    /// Optimistic-concurrency object: a write fails if the version moved
    /// between its read and its replace.
    #[derive(Default)]
    struct Versioned {
        version: AtomicU64,
    }

    impl Versioned {
        async fn write(&self) -> Result<(), StoreError> {
            let seen = self.version.load(Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.version
                .compare_exchange(seen, seen + 1, Ordering::SeqCst, Ordering::SeqCst)
                .map(|_| ())
                .map_err(|_| ClusterError::Conflict("object was modified".into()).into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_all_land() {
        let object = Arc::new(Versioned::default());
        let lock = Arc::new(Mutex::new(()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let object = object.clone();
                let lock = lock.clone();
                tokio::spawn(async move {
                    write_exclusive(&lock, "schedules", || object.write()).await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(object.version.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_persistent_conflict_gives_up() {
        let attempts = AtomicU32::new(0);
        let result = write_exclusive(&Mutex::new(()), "schedules", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::from(ClusterError::Conflict(
                "object was modified".into(),
            )))
        })
        .await;

        assert!(matches!(
            result,
            Err(StoreError::Cluster(ClusterError::Conflict(_)))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_CONFLICT_RETRIES);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result = write_exclusive(&Mutex::new(()), "schedules", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Unavailable("apiserver down".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_then_success() {
        let attempts = AtomicU32::new(0);
        write_exclusive(&Mutex::new(()), "schedules", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::from(ClusterError::Conflict(
                    "object was modified".into(),
                )));
            }
            Ok::<(), StoreError>(())
        })
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
