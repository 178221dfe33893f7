//! StatefulSet CRUD primitives.
//!
//! The trait abstracts the Kubernetes API so the reconcile engine can be
//! driven against an in-memory cluster in unit tests. All async methods must
//! be `Send` to work with Tokio's work-stealing runtime.

use crate::diff::null_at;
use crate::error::OperatorError;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

/// Field manager recorded on every patch.
pub const FIELD_MANAGER: &str = "statefulset-operator";

/// How deleting a StatefulSet treats its pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPropagation {
    /// Only the StatefulSet is removed; its pods keep running
    Orphan,
    /// Pods are deleted before the StatefulSet disappears
    Foreground,
}

impl DeletionPropagation {
    /// `Foreground` when cascading, `Orphan` otherwise.
    #[must_use]
    pub fn from_cascading(cascading: bool) -> Self {
        if cascading { Self::Foreground } else { Self::Orphan }
    }
}

impl From<DeletionPropagation> for PropagationPolicy {
    fn from(propagation: DeletionPropagation) -> Self {
        match propagation {
            DeletionPropagation::Orphan => PropagationPolicy::Orphan,
            DeletionPropagation::Foreground => PropagationPolicy::Foreground,
        }
    }
}

/// StatefulSet API operations.
#[async_trait::async_trait]
pub trait StatefulSetOperations: Send + Sync {
    /// Fetch a StatefulSet, `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, OperatorError>;

    /// Create a StatefulSet. Fails when one with the same name exists.
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
    ) -> Result<StatefulSet, OperatorError>;

    /// Apply `desired` in place, returning the stored result.
    ///
    /// `removed` lists JSON pointers the stored object carries but `desired`
    /// no longer sets; they are deleted. With `cascade` unset the change must
    /// not be propagated to the pods (pod lifecycle is left to rolling-update
    /// logic).
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
        removed: &[String],
        cascade: bool,
    ) -> Result<StatefulSet, OperatorError>;

    /// Delete a StatefulSet. Returns whether a deletion took place.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletionPropagation,
        grace_period_seconds: u32,
    ) -> Result<bool, OperatorError>;
}

/// [`StatefulSetOperations`] against a live cluster.
#[derive(Clone)]
pub struct KubeStatefulSets {
    client: Client,
}

impl std::fmt::Debug for KubeStatefulSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStatefulSets").finish_non_exhaustive()
    }
}

impl KubeStatefulSets {
    /// Wrap a Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl StatefulSetOperations for KubeStatefulSets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, OperatorError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
    ) -> Result<StatefulSet, OperatorError> {
        debug!("Creating StatefulSet {}/{}", namespace, name);
        Ok(self.api(namespace).create(&PostParams::default(), desired).await?)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        desired: &StatefulSet,
        removed: &[String],
        cascade: bool,
    ) -> Result<StatefulSet, OperatorError> {
        // A patch of the StatefulSet object never touches existing pods on the
        // API server; the controller rolls them according to updateStrategy.
        debug!("Patching StatefulSet {}/{} (cascade: {})", namespace, name, cascade);
        let body = patch_body(desired, removed)?;
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        Ok(self.api(namespace).patch(name, &pp, &Patch::Strategic(&body)).await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletionPropagation,
        grace_period_seconds: u32,
    ) -> Result<bool, OperatorError> {
        let dp = DeleteParams {
            propagation_policy: Some(propagation.into()),
            grace_period_seconds: Some(grace_period_seconds),
            ..DeleteParams::default()
        };
        let deleted = self
            .api(namespace)
            .delete(name, &dp)
            .await
            .map(|response| response.either(|_pending| true, |status| status.is_success()));
        deleted_or_absent(namespace, name, deleted)
    }
}

/// Strategic merge patch body: `desired` without server-owned fields, with
/// every removed path set to `null`.
pub(crate) fn patch_body(desired: &StatefulSet, removed: &[String]) -> Result<Value, OperatorError> {
    let mut body = desired.clone();
    body.metadata.resource_version = None;
    body.metadata.managed_fields = None;
    body.status = None;
    let mut body = serde_json::to_value(&body)?;
    for path in removed {
        null_at(&mut body, path);
    }
    Ok(body)
}

/// A StatefulSet that is already gone was not deleted by this call.
fn deleted_or_absent(
    namespace: &str,
    name: &str,
    deleted: Result<bool, kube::Error>,
) -> Result<bool, OperatorError> {
    match deleted {
        Ok(deleted) => Ok(deleted),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("StatefulSet {}/{} not found, nothing to delete", namespace, name);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::with_generation;
    use crate::test_utils::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("statefulsets.apps \"web\" {reason}"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_delete_of_vanished_statefulset_is_not_deleted() {
        let result = deleted_or_absent("ns", "web", Err(api_error(404, "NotFound")));
        assert!(matches!(result, Ok(false)));
    }

    #[test]
    fn test_delete_errors_other_than_not_found_propagate() {
        let result = deleted_or_absent("ns", "web", Err(api_error(403, "Forbidden")));
        assert!(matches!(result, Err(OperatorError::Kube(_))));
        assert!(matches!(deleted_or_absent("ns", "web", Ok(true)), Ok(true)));
    }

    #[test]
    fn test_patch_body_nulls_removed_keys() {
        let mut desired = with_generation(create_test_statefulset("web", "ns", 3), 1);
        desired.metadata.resource_version = Some("42".to_string());
        desired.status = Some(ready_status(3, 1));
        let removed = vec![
            "/spec/template/metadata/annotations/restart-hint".to_string(),
            "/spec/template/spec/containers/0/resources/limits/cpu".to_string(),
        ];

        let body = patch_body(&desired, &removed).unwrap();

        assert!(body.pointer("/metadata/resourceVersion").is_none());
        assert!(body.get("status").is_none());
        assert_eq!(
            body.pointer("/spec/template/metadata/annotations/restart-hint"),
            Some(&Value::Null)
        );
        assert_eq!(
            body.pointer("/spec/template/metadata/annotations/statefulset-operator.io~1generation"),
            Some(&Value::String("1".to_string()))
        );
        assert_eq!(
            body.pointer("/spec/template/spec/containers/0/resources/limits/cpu"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn test_propagation_from_cascading() {
        assert_eq!(DeletionPropagation::from_cascading(true), DeletionPropagation::Foreground);
        assert_eq!(DeletionPropagation::from_cascading(false), DeletionPropagation::Orphan);
    }

    #[test]
    fn test_propagation_into_kube_policy() {
        assert!(matches!(
            PropagationPolicy::from(DeletionPropagation::Orphan),
            PropagationPolicy::Orphan
        ));
        assert!(matches!(
            PropagationPolicy::from(DeletionPropagation::Foreground),
            PropagationPolicy::Foreground
        ));
    }
}
