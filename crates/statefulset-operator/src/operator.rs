//! StatefulSet reconcile engine.
//!
//! Drives a StatefulSet towards a desired spec:
//! - absent → create, then wait for the StatefulSet and every replica to be ready
//! - present → diff, carry or bump the generation annotation, then patch in place
//!   or, for changes the API server rejects in place, delete and recreate
//!
//! Nothing here retries. A failed pass leaves the cluster in whatever state the
//! last successful step produced; the next pass picks up from there.

use crate::annotations::{
    INIT_GENERATION, NO_GENERATION, read_generation, set_generation, sts_generation, with_generation,
};
use crate::config::OperatorConfig;
use crate::diff::{GenerationPolicy, JsonStatefulSetDiffer, SpecDiffer, StatefulSetDiff};
use crate::error::OperatorError;
use crate::pods::{KubePods, PodOperations};
use crate::pool::WorkerPool;
use crate::readiness::{WaitTarget, is_statefulset_ready, join_all_ready, wait_for};
use crate::reconciliation::Reconciliation;
use crate::resource::{DeletionPropagation, KubeStatefulSets, StatefulSetOperations};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Client;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resource kind used in logs and errors.
pub const KIND: &str = "StatefulSet";

/// Deletes and recreates are immediate.
const GRACE_PERIOD_SECONDS: u32 = 0;

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileResult<T> {
    /// The resource did not exist and was created
    Created(T),
    /// The resource was changed in place
    Patched(T),
    /// The resource was deleted and recreated
    Replaced(T),
    /// Nothing needed to change
    Noop(T),
    /// The resource is gone
    Deleted,
}

impl<T> ReconcileResult<T> {
    /// The observed resource, if any.
    pub fn resource(&self) -> Option<&T> {
        match self {
            Self::Created(r) | Self::Patched(r) | Self::Replaced(r) | Self::Noop(r) => Some(r),
            Self::Deleted => None,
        }
    }

    /// Consume into the observed resource, if any.
    pub fn into_resource(self) -> Option<T> {
        match self {
            Self::Created(r) | Self::Patched(r) | Self::Replaced(r) | Self::Noop(r) => Some(r),
            Self::Deleted => None,
        }
    }

    /// Whether the pass changed anything in the cluster.
    pub fn is_changed(&self) -> bool {
        !matches!(self, Self::Noop(_))
    }
}

/// Reconciles StatefulSets.
pub struct StatefulSetOperator {
    statefulsets: Arc<dyn StatefulSetOperations>,
    pods: Arc<dyn PodOperations>,
    differ: Arc<dyn SpecDiffer>,
    policy: Arc<dyn GenerationPolicy>,
    worker_pool: WorkerPool,
    config: OperatorConfig,
}

impl std::fmt::Debug for StatefulSetOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulSetOperator")
            .field("worker_pool", &self.worker_pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StatefulSetOperator {
    /// Creates an operator talking to a live cluster.
    pub fn new(
        client: Client,
        config: OperatorConfig,
        policy: impl GenerationPolicy + 'static,
    ) -> Self {
        Self::with_operations(
            Arc::new(KubeStatefulSets::new(client.clone())),
            Arc::new(KubePods::new(client)),
            policy,
            config,
        )
    }

    /// Creates an operator over arbitrary API implementations.
    pub fn with_operations(
        statefulsets: Arc<dyn StatefulSetOperations>,
        pods: Arc<dyn PodOperations>,
        policy: impl GenerationPolicy + 'static,
        config: OperatorConfig,
    ) -> Self {
        let worker_pool = WorkerPool::new(&config.worker_pool_name, config.worker_pool_size);
        Self {
            statefulsets,
            pods,
            differ: Arc::new(JsonStatefulSetDiffer),
            policy: Arc::new(policy),
            worker_pool,
            config,
        }
    }

    /// Replace the spec differ.
    #[must_use]
    pub fn with_differ(mut self, differ: impl SpecDiffer + 'static) -> Self {
        self.differ = Arc::new(differ);
        self
    }

    /// The configuration this operator was built with.
    #[must_use]
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Name of the pod with the given ordinal: `<template name>-<ordinal>`.
    ///
    /// Falls back to the StatefulSet's own name when the template is unnamed.
    pub fn replica_name(sts: &StatefulSet, ordinal: i32) -> String {
        let template_name = sts
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.name.as_deref())
            .or(sts.metadata.name.as_deref())
            .unwrap_or_default();
        format!("{template_name}-{ordinal}")
    }

    /// Generation annotation of a possibly-absent StatefulSet.
    pub fn generation(sts: Option<&StatefulSet>) -> i64 {
        sts_generation(sts)
    }

    /// Replica count of the stored StatefulSet, `None` when it does not exist.
    pub async fn current_scale(&self, namespace: &str, name: &str) -> Result<Option<i32>, OperatorError> {
        Ok(self
            .statefulsets
            .get(namespace, name)
            .await?
            .and_then(|sts| sts.spec.and_then(|spec| spec.replicas)))
    }

    /// Reconcile the named StatefulSet towards `desired`.
    ///
    /// `None` deletes the StatefulSet together with its pods.
    pub async fn reconcile(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        desired: Option<StatefulSet>,
    ) -> Result<ReconcileResult<StatefulSet>, OperatorError> {
        let current = self.statefulsets.get(namespace, name).await?;
        match (current, desired) {
            (None, None) => {
                debug!(%reconciliation, "{} {}/{} does not exist, nothing to delete", KIND, namespace, name);
                Ok(ReconcileResult::Deleted)
            }
            (Some(_), None) => self.reconcile_delete(reconciliation, namespace, name).await,
            (None, Some(desired)) => {
                self.reconcile_create(reconciliation, namespace, name, desired).await
            }
            (Some(current), Some(desired)) => {
                self.reconcile_update(reconciliation, namespace, name, &current, desired)
                    .await
            }
        }
    }

    /// Create the StatefulSet, then wait until it and all of its replicas are ready.
    pub async fn reconcile_create(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        desired: StatefulSet,
    ) -> Result<ReconcileResult<StatefulSet>, OperatorError> {
        let desired = with_generation(desired, INIT_GENERATION);
        trace!(%reconciliation, "Creating {} {}/{} with spec {:?}", KIND, namespace, name, desired);
        debug!(%reconciliation, "Creating {} {}/{}", KIND, namespace, name);

        let created = self.statefulsets.create(namespace, name, &desired).await?;

        self.readiness(reconciliation, namespace, name).await?;
        self.pod_readiness(reconciliation, namespace, &desired).await?;

        debug!(%reconciliation, "{} {}/{} created and ready", KIND, namespace, name);
        Ok(ReconcileResult::Created(created))
    }

    /// Bring an existing StatefulSet in line with `desired`.
    ///
    /// The replica count is always taken from `current`; scaling is not a side
    /// effect of a template change.
    pub async fn reconcile_update(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        current: &StatefulSet,
        mut desired: StatefulSet,
    ) -> Result<ReconcileResult<StatefulSet>, OperatorError> {
        // Don't scale via patch
        let current_replicas = current.spec.as_ref().and_then(|spec| spec.replicas);
        desired.spec.get_or_insert_with(Default::default).replicas = current_replicas;

        let diff = self.differ.diff(reconciliation, current, &desired)?;

        let current_generation = read_generation(current, INIT_GENERATION);
        let generation = if self.policy.should_increment_generation(reconciliation, &diff) {
            current_generation
                .checked_add(1)
                .ok_or_else(|| OperatorError::GenerationOverflow {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    generation: current_generation,
                })?
        } else {
            current_generation
        };
        set_generation(&mut desired, generation);

        if diff.is_empty() && read_generation(current, NO_GENERATION) == generation {
            debug!(%reconciliation, "{} {}/{} is up to date", KIND, namespace, name);
            return Ok(ReconcileResult::Noop(current.clone()));
        }

        trace!(%reconciliation, "Patching {} {}/{} to match desired state {:?}", KIND, namespace, name, desired);
        debug!(%reconciliation, "Patching {} {}/{}", KIND, namespace, name);

        if diff.requires_replace() {
            // Volume claim templates are immutable: delete the StatefulSet
            // without its pods and re-create it
            self.replace(reconciliation, namespace, name, current, desired, false)
                .await
        } else {
            let patched = self
                .statefulsets
                .patch(namespace, name, &desired, diff.removed(), false)
                .await?;
            if self.was_changed(reconciliation, current, &patched)? {
                Ok(ReconcileResult::Patched(patched))
            } else {
                Ok(ReconcileResult::Noop(patched))
            }
        }
    }

    /// Delete and recreate the StatefulSet.
    ///
    /// Used when a change cannot be patched in place. With `cascading` unset
    /// the pods survive the delete and are adopted by the new StatefulSet; a
    /// rolling update afterwards moves them onto the new spec. No create is
    /// attempted unless the old StatefulSet is confirmed gone.
    pub async fn replace(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        current: &StatefulSet,
        desired: StatefulSet,
        cascading: bool,
    ) -> Result<ReconcileResult<StatefulSet>, OperatorError> {
        let result: Result<ReconcileResult<StatefulSet>, OperatorError> = async {
            let propagation = DeletionPropagation::from_cascading(cascading);
            self.statefulsets
                .delete(namespace, name, propagation, GRACE_PERIOD_SECONDS)
                .await?;

            self.wait_until_deleted(reconciliation, namespace, name).await?;

            let created = self.statefulsets.create(namespace, name, &desired).await?;
            debug!(%reconciliation, "{} {} in namespace {} has been replaced", KIND, name, namespace);

            if self.was_changed(reconciliation, current, &created)? {
                Ok(ReconcileResult::Replaced(created))
            } else {
                Ok(ReconcileResult::Noop(created))
            }
        }
        .await;

        result.map_err(|e| {
            debug!(%reconciliation, "Caught exception while replacing {} {} in namespace {}: {}", KIND, name, namespace, e);
            OperatorError::Replace {
                kind: KIND.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: Box::new(e),
            }
        })
    }

    /// Delete the StatefulSet on the worker pool.
    ///
    /// Succeeds only when the API reports that a deletion took place.
    pub async fn delete_async(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        cascading: bool,
    ) -> Result<(), OperatorError> {
        let statefulsets = Arc::clone(&self.statefulsets);
        let reconciliation = reconciliation.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();
        let propagation = DeletionPropagation::from_cascading(cascading);

        self.worker_pool
            .execute(async move {
                let deleted = statefulsets
                    .delete(&namespace, &name, propagation, GRACE_PERIOD_SECONDS)
                    .await;
                match deleted {
                    Ok(true) => {
                        debug!(%reconciliation, "{} {} in namespace {} has been deleted", KIND, name, namespace);
                        Ok(())
                    }
                    Ok(false) => {
                        debug!(%reconciliation, "{} {} in namespace {} has not been deleted", KIND, name, namespace);
                        Err(OperatorError::NotDeleted {
                            kind: KIND.to_string(),
                            namespace,
                            name,
                        })
                    }
                    Err(e) => {
                        debug!(%reconciliation, "Caught exception while deleting {} {} in namespace {}: {}", KIND, name, namespace, e);
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Wait until the StatefulSet reports ready.
    pub async fn readiness(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError> {
        let target = WaitTarget {
            kind: KIND,
            namespace,
            name,
            state: "ready",
        };
        wait_for(
            reconciliation,
            target,
            self.config.poll_interval,
            self.config.operation_timeout,
            move || async move {
                Ok(self
                    .statefulsets
                    .get(namespace, name)
                    .await?
                    .as_ref()
                    .is_some_and(is_statefulset_ready))
            },
        )
        .await
    }

    /// Wait until pods `0..replicas` of `desired` are all ready.
    ///
    /// Every replica is waited on concurrently and all waits settle before the
    /// result is reported, so a failure names every unready replica.
    pub async fn pod_readiness(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        desired: &StatefulSet,
    ) -> Result<(), OperatorError> {
        let replicas = desired.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
        let name = desired.metadata.name.as_deref().unwrap_or_default();
        let poll_interval = self.config.poll_interval;
        let timeout = self.config.operation_timeout;

        let waits = (0..replicas)
            .map(|ordinal| {
                let pod_name = Self::replica_name(desired, ordinal);
                let pods = Arc::clone(&self.pods);
                let wait_name = pod_name.clone();
                let wait = async move {
                    pods.readiness(reconciliation, namespace, &wait_name, poll_interval, timeout)
                        .await
                };
                (pod_name, wait)
            })
            .collect();

        join_all_ready(namespace, name, waits).await
    }

    async fn reconcile_delete(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileResult<StatefulSet>, OperatorError> {
        debug!(%reconciliation, "Deleting {} {}/{}", KIND, namespace, name);
        self.statefulsets
            .delete(namespace, name, DeletionPropagation::Foreground, GRACE_PERIOD_SECONDS)
            .await?;
        self.wait_until_deleted(reconciliation, namespace, name).await?;
        Ok(ReconcileResult::Deleted)
    }

    async fn wait_until_deleted(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError> {
        let target = WaitTarget {
            kind: KIND,
            namespace,
            name,
            state: "deleted",
        };
        wait_for(
            reconciliation,
            target,
            self.config.poll_interval,
            self.config.operation_timeout,
            move || async move {
                trace!(%reconciliation, "Checking if {} {} in namespace {} has been deleted", KIND, name, namespace);
                Ok(self.statefulsets.get(namespace, name).await?.is_none())
            },
        )
        .await
    }

    /// Two observations differ when their resource versions do; without
    /// versions, fall back to comparing the specs.
    fn was_changed(
        &self,
        reconciliation: &Reconciliation,
        current: &StatefulSet,
        result: &StatefulSet,
    ) -> Result<bool, OperatorError> {
        match (
            current.metadata.resource_version.as_deref(),
            result.metadata.resource_version.as_deref(),
        ) {
            (Some(before), Some(after)) => Ok(before != after),
            _ => {
                let diff: StatefulSetDiff = self.differ.diff(reconciliation, current, result)?;
                Ok(!diff.is_empty())
            }
        }
    }
}
