//! In-memory cluster for unit testing
//!
//! `MockStatefulSets` and `MockPods` implement the operation traits against
//! shared in-memory maps. Every write call is recorded so tests can assert on
//! exactly what the engine submitted, and failure modes can be switched on per
//! test.

#![allow(clippy::unwrap_used, reason = "test double")]

use crate::diff::unescape;
use crate::error::OperatorError;
use crate::pods::PodOperations;
use crate::resource::{DeletionPropagation, StatefulSetOperations};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A write call received by [`MockStatefulSets`].
#[derive(Debug, Clone)]
pub enum Call {
    /// `create` was called with this spec
    Create {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
        /// Submitted spec
        desired: StatefulSet,
    },
    /// `patch` was called with this spec
    Patch {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
        /// Submitted spec
        desired: StatefulSet,
        /// Paths submitted for deletion
        removed: Vec<String>,
        /// Whether the patch may cascade to pods
        cascade: bool,
    },
    /// `delete` was called
    Delete {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
        /// Propagation mode
        propagation: DeletionPropagation,
        /// Grace period
        grace_period_seconds: u32,
    },
}

#[derive(Debug)]
struct Behaviour {
    fail_get: Option<String>,
    fail_create: Option<String>,
    fail_patch: Option<String>,
    fail_delete: Option<String>,
    delete_reports_deleted: bool,
    linger_polls: u32,
    never_disappear: bool,
    auto_ready: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            fail_get: None,
            fail_create: None,
            fail_patch: None,
            fail_delete: None,
            delete_reports_deleted: true,
            linger_polls: 0,
            never_disappear: false,
            auto_ready: true,
        }
    }
}

/// Mock [`StatefulSetOperations`]
#[derive(Debug, Clone, Default)]
pub struct MockStatefulSets {
    store: Arc<Mutex<HashMap<Key, StatefulSet>>>,
    // Deleted but still visible: remaining gets before it disappears
    terminating: Arc<Mutex<HashMap<Key, u32>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    gets: Arc<Mutex<u32>>,
    behaviour: Arc<Mutex<Behaviour>>,
    next_version: Arc<Mutex<u64>>,
}

impl MockStatefulSets {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a StatefulSet as-is (for test setup)
    pub fn insert(&self, sts: StatefulSet) {
        let namespace = sts.metadata.namespace.clone().unwrap_or_default();
        let name = sts.metadata.name.clone().unwrap_or_default();
        self.store.lock().unwrap().insert(key(&namespace, &name), sts);
    }

    /// Stored StatefulSet, bypassing call recording
    pub fn stored(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        self.store.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Every write call received so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of `get` calls received
    pub fn get_count(&self) -> u32 {
        *self.gets.lock().unwrap()
    }

    /// Specs submitted to `create`
    pub fn creates(&self) -> Vec<StatefulSet> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create { desired, .. } => Some(desired),
                _ => None,
            })
            .collect()
    }

    /// Specs and cascade flags submitted to `patch`
    pub fn patches(&self) -> Vec<(StatefulSet, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Patch { desired, cascade, .. } => Some((desired, cascade)),
                _ => None,
            })
            .collect()
    }

    /// Paths submitted for deletion by every `patch`
    pub fn patch_removals(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Patch { removed, .. } => Some(removed),
                _ => None,
            })
            .collect()
    }

    /// Propagation and grace period of every `delete`
    pub fn deletes(&self) -> Vec<(DeletionPropagation, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete { propagation, grace_period_seconds, .. } => {
                    Some((propagation, grace_period_seconds))
                }
                _ => None,
            })
            .collect()
    }

    /// Make every `get` fail
    pub fn fail_get(&self, message: &str) {
        self.behaviour.lock().unwrap().fail_get = Some(message.to_string());
    }

    /// Make every `create` fail
    pub fn fail_create(&self, message: &str) {
        self.behaviour.lock().unwrap().fail_create = Some(message.to_string());
    }

    /// Make every `patch` fail
    pub fn fail_patch(&self, message: &str) {
        self.behaviour.lock().unwrap().fail_patch = Some(message.to_string());
    }

    /// Make every `delete` fail
    pub fn fail_delete(&self, message: &str) {
        self.behaviour.lock().unwrap().fail_delete = Some(message.to_string());
    }

    /// `delete` returns `false` and leaves the resource in place
    pub fn delete_reports_nothing_deleted(&self) {
        self.behaviour.lock().unwrap().delete_reports_deleted = false;
    }

    /// Deleted resources stay visible for `polls` further gets
    pub fn linger_after_delete(&self, polls: u32) {
        self.behaviour.lock().unwrap().linger_polls = polls;
    }

    /// Deleted resources never disappear (stuck finalizer)
    pub fn never_disappear(&self) {
        self.behaviour.lock().unwrap().never_disappear = true;
    }

    /// Created / patched resources do not report ready status
    pub fn without_auto_ready(&self) {
        self.behaviour.lock().unwrap().auto_ready = false;
    }

    fn next_resource_version(&self) -> String {
        let mut version = self.next_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Delete the value at `pointer`; returns whether anything was there.
fn remove_at(value: &mut Value, pointer: &str) -> bool {
    let Some((parent, key)) = pointer.rsplit_once('/') else {
        return false;
    };
    match value.pointer_mut(parent) {
        Some(Value::Object(fields)) => fields.remove(&unescape(key)).is_some(),
        _ => false,
    }
}

fn ready_status(sts: &StatefulSet) -> StatefulSetStatus {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        current_replicas: Some(replicas),
        updated_replicas: Some(replicas),
        observed_generation: sts.metadata.generation,
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl StatefulSetOperations for MockStatefulSets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, OperatorError> {
        *self.gets.lock().unwrap() += 1;
        if let Some(message) = self.behaviour.lock().unwrap().fail_get.clone() {
            return Err(OperatorError::Api(message));
        }
        let k = key(namespace, name);
        let mut terminating = self.terminating.lock().unwrap();
        let mut store = self.store.lock().unwrap();
        if let Some(remaining) = terminating.get_mut(&k) {
            if *remaining == 0 {
                terminating.remove(&k);
                store.remove(&k);
                return Ok(None);
            }
            *remaining -= 1;
        }
        Ok(store.get(&k).cloned())
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
    ) -> Result<StatefulSet, OperatorError> {
        self.record(Call::Create {
            namespace: namespace.to_string(),
            name: name.to_string(),
            desired: desired.clone(),
        });
        let auto_ready = {
            let behaviour = self.behaviour.lock().unwrap();
            if let Some(message) = behaviour.fail_create.clone() {
                return Err(OperatorError::Api(message));
            }
            behaviour.auto_ready
        };
        let k = key(namespace, name);
        if self.store.lock().unwrap().contains_key(&k) {
            return Err(OperatorError::Api(format!(
                "statefulsets.apps \"{name}\" already exists"
            )));
        }

        let mut created = desired.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.name = Some(name.to_string());
        created.metadata.resource_version = Some(self.next_resource_version());
        created.metadata.generation = Some(1);
        created.status = auto_ready.then(|| ready_status(&created));

        self.store.lock().unwrap().insert(k, created.clone());
        Ok(created)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
        removed: &[String],
        cascade: bool,
    ) -> Result<StatefulSet, OperatorError> {
        self.record(Call::Patch {
            namespace: namespace.to_string(),
            name: name.to_string(),
            desired: desired.clone(),
            removed: removed.to_vec(),
            cascade,
        });
        let auto_ready = {
            let behaviour = self.behaviour.lock().unwrap();
            if let Some(message) = behaviour.fail_patch.clone() {
                return Err(OperatorError::Api(message));
            }
            behaviour.auto_ready
        };
        let next_version = self.next_resource_version();
        let mut store = self.store.lock().unwrap();
        let stored = store.get_mut(&key(namespace, name)).ok_or_else(|| {
            OperatorError::Api(format!("statefulsets.apps \"{name}\" not found"))
        })?;

        let mut changed = stored.spec != desired.spec
            || (desired.metadata.labels.is_some() && stored.metadata.labels != desired.metadata.labels)
            || (desired.metadata.annotations.is_some()
                && stored.metadata.annotations != desired.metadata.annotations);
        if changed {
            stored.spec = desired.spec.clone();
            if desired.metadata.labels.is_some() {
                stored.metadata.labels = desired.metadata.labels.clone();
            }
            if desired.metadata.annotations.is_some() {
                stored.metadata.annotations = desired.metadata.annotations.clone();
            }
        }
        if !removed.is_empty() {
            let mut value = serde_json::to_value(&*stored).unwrap();
            let mut removed_any = false;
            for path in removed {
                removed_any |= remove_at(&mut value, path);
            }
            if removed_any {
                *stored = serde_json::from_value(value).unwrap();
                changed = true;
            }
        }
        if changed {
            stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
            stored.metadata.resource_version = Some(next_version);
            if auto_ready {
                stored.status = Some(ready_status(stored));
            }
        }
        Ok(stored.clone())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletionPropagation,
        grace_period_seconds: u32,
    ) -> Result<bool, OperatorError> {
        self.record(Call::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
            propagation,
            grace_period_seconds,
        });
        let behaviour = self.behaviour.lock().unwrap();
        if let Some(message) = behaviour.fail_delete.clone() {
            return Err(OperatorError::Api(message));
        }
        let k = key(namespace, name);
        let mut terminating = self.terminating.lock().unwrap();
        let mut store = self.store.lock().unwrap();
        if !store.contains_key(&k) || !behaviour.delete_reports_deleted {
            return Ok(false);
        }
        if behaviour.never_disappear {
            terminating.insert(k, u32::MAX);
        } else if behaviour.linger_polls > 0 {
            terminating.insert(k, behaviour.linger_polls);
        } else {
            store.remove(&k);
        }
        Ok(true)
    }
}

/// Mock [`PodOperations`]
///
/// A pod becomes ready at its configured instant; pods never added do not exist.
#[derive(Debug, Clone, Default)]
pub struct MockPods {
    ready_at: Arc<Mutex<HashMap<Key, Option<Instant>>>>,
}

impl MockPods {
    /// Create a mock with no pods
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod that is ready immediately
    pub fn add_ready_pod(&self, namespace: &str, name: &str) {
        self.add_pod_ready_after(namespace, name, Duration::ZERO);
    }

    /// Add a pod that becomes ready once `delay` has elapsed
    pub fn add_pod_ready_after(&self, namespace: &str, name: &str, delay: Duration) {
        self.ready_at
            .lock()
            .unwrap()
            .insert(key(namespace, name), Some(Instant::now() + delay));
    }

    /// Add a pod that never becomes ready
    pub fn add_unready_pod(&self, namespace: &str, name: &str) {
        self.ready_at.lock().unwrap().insert(key(namespace, name), None);
    }

    /// Add `replicas` ready pods named after the StatefulSet
    pub fn add_ready_replicas(&self, namespace: &str, sts_name: &str, replicas: i32) {
        for ordinal in 0..replicas {
            self.add_ready_pod(namespace, &format!("{sts_name}-{ordinal}"));
        }
    }
}

#[async_trait::async_trait]
impl PodOperations for MockPods {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, OperatorError> {
        let ready_at = self.ready_at.lock().unwrap().get(&key(namespace, name)).copied();
        Ok(ready_at.map(|ready_at| {
            let ready = ready_at.is_some_and(|at| Instant::now() >= at);
            Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: None,
                status: Some(PodStatus {
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: if ready { "True" } else { "False" }.to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            }
        }))
    }
}
