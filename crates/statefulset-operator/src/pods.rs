//! Pod lookups and per-replica readiness.

use crate::error::OperatorError;
use crate::readiness::{WaitTarget, is_pod_ready, wait_for};
use crate::reconciliation::Reconciliation;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::time::Duration;

/// Pod API operations.
#[async_trait::async_trait]
pub trait PodOperations: Send + Sync {
    /// Fetch a pod, `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, OperatorError>;

    /// Wait until the named pod reports ready, or `timeout` elapses.
    async fn readiness(
        &self,
        reconciliation: &Reconciliation,
        namespace: &str,
        name: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<(), OperatorError> {
        let target = WaitTarget {
            kind: "Pod",
            namespace,
            name,
            state: "ready",
        };
        wait_for(reconciliation, target, poll_interval, timeout, move || async move {
            Ok(self.get(namespace, name).await?.as_ref().is_some_and(is_pod_ready))
        })
        .await
    }
}

/// [`PodOperations`] against a live cluster.
#[derive(Clone)]
pub struct KubePods {
    client: Client,
}

impl std::fmt::Debug for KubePods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePods").finish_non_exhaustive()
    }
}

impl KubePods {
    /// Wrap a Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PodOperations for KubePods {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, OperatorError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
