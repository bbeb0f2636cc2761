//! The object store seam.
//!
//! `Store` is the generic CRUD surface the engine runs against: point
//! reads, create, update, delete, plus the one status write-back. The
//! kube-backed implementation maps API errors onto the closed taxonomy;
//! the in-memory implementation keeps real store semantics (create fails
//! on existing keys, updates check resourceVersion) so tests exercise the
//! same contract the cluster enforces.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use promstack_crd::{MonitoringStack, MonitoringStackStatus};

use crate::error::StoreError;

/// Bound for everything the engine reads or writes: a namespaced,
/// statically-typed resource with serde both ways.
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub(crate) fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).into_owned()
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Point read; absence is a valid state, not an error.
    async fn get<K: StoredObject>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn list<K: StoredObject>(&self, ns: &str) -> Result<Vec<K>, StoreError>;

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError>;

    async fn update<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError>;

    async fn delete<K: StoredObject>(&self, ns: &str, name: &str) -> Result<(), StoreError>;

    /// The single status write-back per pass.
    async fn patch_status(
        &self,
        ns: &str,
        name: &str,
        status: &MonitoringStackStatus,
    ) -> Result<(), StoreError>;
}

/// Store backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoredObject>(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn map_kube_err(kind: &str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (404, _) => StoreError::NotFound { kind: kind.to_string(), name: name.to_string() },
            (409, "AlreadyExists") => {
                StoreError::AlreadyExists { kind: kind.to_string(), name: name.to_string() }
            }
            (409, _) => StoreError::Conflict { kind: kind.to_string(), name: name.to_string() },
            _ => StoreError::Unavailable { message: resp.to_string() },
        },
        other => StoreError::Unavailable { message: other.to_string() },
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoredObject>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api::<K>(ns)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err(&kind_of::<K>(), name, e))
    }

    async fn list<K: StoredObject>(&self, ns: &str) -> Result<Vec<K>, StoreError> {
        let list = self
            .api::<K>(ns)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(&kind_of::<K>(), "*", e))?;
        Ok(list.items)
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&ns)
            .create(&PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(&kind_of::<K>(), &name, e))
    }

    async fn update<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&ns)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(&kind_of::<K>(), &name, e))
    }

    async fn delete<K: StoredObject>(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        self.api::<K>(ns)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(&kind_of::<K>(), name, e))
    }

    async fn patch_status(
        &self,
        ns: &str,
        name: &str,
        status: &MonitoringStackStatus,
    ) -> Result<(), StoreError> {
        let api: Api<MonitoringStack> = Api::namespaced(self.client.clone(), ns);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("MonitoringStack", name, e))
    }
}

pub mod memory {
    //! In-process store with the cluster's write semantics, for tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use kube::ResourceExt;
    use serde_json::Value;

    use promstack_crd::MonitoringStackStatus;

    use super::{kind_of, Store, StoredObject};
    use crate::error::StoreError;

    type Key = (String, String, String); // kind, namespace, name

    #[derive(Debug, Default)]
    struct Counters {
        creates: usize,
        updates: usize,
        deletes: usize,
        status_writes: usize,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        objects: Mutex<BTreeMap<Key, Value>>,
        statuses: Mutex<BTreeMap<(String, String), MonitoringStackStatus>>,
        counters: Mutex<Counters>,
        next_uid: Mutex<u64>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn creates(&self) -> usize {
            self.counters.lock().unwrap().creates
        }

        pub fn updates(&self) -> usize {
            self.counters.lock().unwrap().updates
        }

        pub fn deletes(&self) -> usize {
            self.counters.lock().unwrap().deletes
        }

        pub fn status_writes(&self) -> usize {
            self.counters.lock().unwrap().status_writes
        }

        pub fn status_of(&self, ns: &str, name: &str) -> Option<MonitoringStackStatus> {
            self.statuses.lock().unwrap().get(&(ns.to_string(), name.to_string())).cloned()
        }

        pub fn contains<K: StoredObject>(&self, ns: &str, name: &str) -> bool {
            self.objects
                .lock()
                .unwrap()
                .contains_key(&(kind_of::<K>(), ns.to_string(), name.to_string()))
        }

        fn key_of<K: StoredObject>(obj: &K) -> Key {
            (kind_of::<K>(), obj.namespace().unwrap_or_default(), obj.name_any())
        }

        fn meta_str(value: &Value, field: &str) -> Option<String> {
            value
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        }

        fn set_meta(value: &mut Value, field: &str, s: String) {
            if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert(field.to_string(), Value::String(s));
            }
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get<K: StoredObject>(
            &self,
            ns: &str,
            name: &str,
        ) -> Result<Option<K>, StoreError> {
            let objects = self.objects.lock().unwrap();
            let key = (kind_of::<K>(), ns.to_string(), name.to_string());
            match objects.get(&key) {
                None => Ok(None),
                Some(value) => serde_json::from_value(value.clone())
                    .map(Some)
                    .map_err(|e| StoreError::Unavailable { message: e.to_string() }),
            }
        }

        async fn list<K: StoredObject>(&self, ns: &str) -> Result<Vec<K>, StoreError> {
            let objects = self.objects.lock().unwrap();
            let kind = kind_of::<K>();
            objects
                .iter()
                .filter(|((k, n, _), _)| *k == kind && n == ns)
                .map(|(_, value)| {
                    serde_json::from_value(value.clone())
                        .map_err(|e| StoreError::Unavailable { message: e.to_string() })
                })
                .collect()
        }

        async fn create<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError> {
            let key = Self::key_of(obj);
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists { kind: key.0, name: key.2 });
            }
            let mut value = serde_json::to_value(obj)
                .map_err(|e| StoreError::Unavailable { message: e.to_string() })?;
            Self::set_meta(&mut value, "resourceVersion", "1".to_string());
            if Self::meta_str(&value, "uid").is_none() {
                let mut next = self.next_uid.lock().unwrap();
                *next += 1;
                Self::set_meta(&mut value, "uid", format!("mem-uid-{next}"));
            }
            if Self::meta_str(&value, "creationTimestamp").is_none() {
                Self::set_meta(&mut value, "creationTimestamp", Utc::now().to_rfc3339());
            }
            objects.insert(key, value);
            self.counters.lock().unwrap().creates += 1;
            Ok(())
        }

        async fn update<K: StoredObject>(&self, obj: &K) -> Result<(), StoreError> {
            let key = Self::key_of(obj);
            let mut objects = self.objects.lock().unwrap();
            let current = match objects.get(&key) {
                Some(v) => v.clone(),
                None => return Err(StoreError::NotFound { kind: key.0, name: key.2 }),
            };
            let mut value = serde_json::to_value(obj)
                .map_err(|e| StoreError::Unavailable { message: e.to_string() })?;
            let live_rv = Self::meta_str(&current, "resourceVersion").unwrap_or_default();
            let sent_rv = Self::meta_str(&value, "resourceVersion");
            if sent_rv.as_deref() != Some(live_rv.as_str()) {
                return Err(StoreError::Conflict { kind: key.0, name: key.2 });
            }
            let next_rv = live_rv.parse::<u64>().unwrap_or(0) + 1;
            Self::set_meta(&mut value, "resourceVersion", next_rv.to_string());
            // server-owned fields are never client-writable
            for field in ["uid", "creationTimestamp"] {
                if let Some(v) = Self::meta_str(&current, field) {
                    Self::set_meta(&mut value, field, v);
                }
            }
            objects.insert(key, value);
            self.counters.lock().unwrap().updates += 1;
            Ok(())
        }

        async fn delete<K: StoredObject>(&self, ns: &str, name: &str) -> Result<(), StoreError> {
            let key = (kind_of::<K>(), ns.to_string(), name.to_string());
            let mut objects = self.objects.lock().unwrap();
            if objects.remove(&key).is_none() {
                return Err(StoreError::NotFound { kind: key.0, name: key.2 });
            }
            self.counters.lock().unwrap().deletes += 1;
            Ok(())
        }

        async fn patch_status(
            &self,
            ns: &str,
            name: &str,
            status: &MonitoringStackStatus,
        ) -> Result<(), StoreError> {
            // mirror into the stored stack object when it is tracked
            let key = ("MonitoringStack".to_string(), ns.to_string(), name.to_string());
            let mut objects = self.objects.lock().unwrap();
            if let Some(value) = objects.get_mut(&key) {
                if let Some(map) = value.as_object_mut() {
                    map.insert(
                        "status".to_string(),
                        serde_json::to_value(status)
                            .map_err(|e| StoreError::Unavailable { message: e.to_string() })?,
                    );
                }
            }
            drop(objects);
            self.statuses
                .lock()
                .unwrap()
                .insert((ns.to_string(), name.to_string()), status.clone());
            self.counters.lock().unwrap().status_writes += 1;
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryStore::new();
        store.create(&cm("a")).await.unwrap();
        let fetched: ConfigMap = store.get("ns", "a").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.resource_version.as_deref(), Some("1"));
        assert!(fetched.metadata.uid.is_some());
        assert!(fetched.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn double_create_already_exists() {
        let store = MemoryStore::new();
        store.create(&cm("a")).await.unwrap();
        let err = store.create(&cm("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::new();
        store.create(&cm("a")).await.unwrap();
        let live: ConfigMap = store.get("ns", "a").await.unwrap().unwrap();
        // first writer wins
        store.update(&live).await.unwrap();
        // second writer still holds rv "1"
        let err = store.update(&live).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_preserves_server_fields() {
        let store = MemoryStore::new();
        store.create(&cm("a")).await.unwrap();
        let mut live: ConfigMap = store.get("ns", "a").await.unwrap().unwrap();
        let uid = live.metadata.uid.clone();
        live.metadata.uid = Some("client-fabricated".to_string());
        store.update(&live).await.unwrap();
        let after: ConfigMap = store.get("ns", "a").await.unwrap().unwrap();
        assert_eq!(after.metadata.uid, uid);
        assert_eq!(after.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn missing_get_is_none_not_error() {
        let store = MemoryStore::new();
        let fetched: Option<ConfigMap> = store.get("ns", "ghost").await.unwrap();
        assert!(fetched.is_none());
    }
}
