//! Readiness waiting.
//!
//! Waits are timer driven: between polls the task sleeps on the tokio timer,
//! so no thread is occupied while a wait is idle. Every wait has a hard
//! deadline, and a single predicate call may not outlive it either.

use crate::error::OperatorError;
use crate::reconciliation::Reconciliation;
use futures::future::join_all;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, trace, warn};

/// Identifies the resource a wait is about, for logs and errors.
#[derive(Debug, Clone, Copy)]
pub struct WaitTarget<'a> {
    /// Resource kind
    pub kind: &'a str,
    /// Namespace of the resource
    pub namespace: &'a str,
    /// Name of the resource
    pub name: &'a str,
    /// State being waited for ("ready", "deleted")
    pub state: &'a str,
}

/// Poll `check` every `poll_interval` until it returns `true` or `timeout` elapses.
///
/// The first check runs immediately. A check that fails is logged and the
/// wait continues; only the deadline ends an unsuccessful wait.
pub async fn wait_for<F, Fut>(
    reconciliation: &Reconciliation,
    target: WaitTarget<'_>,
    poll_interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), OperatorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, OperatorError>>,
{
    let WaitTarget { kind, namespace, name, state } = target;
    debug!(%reconciliation, "Waiting for {} {}/{} to get {}", kind, namespace, name, state);

    let deadline = Instant::now() + timeout;
    loop {
        match timeout_at(deadline, check()).await {
            Ok(Ok(true)) => {
                debug!(%reconciliation, "{} {}/{} is {}", kind, namespace, name, state);
                return Ok(());
            }
            Ok(Ok(false)) => {
                trace!(%reconciliation, "{} {}/{} is not {} yet", kind, namespace, name, state);
            }
            Ok(Err(e)) => {
                warn!(
                    %reconciliation,
                    "Caught exception while waiting for {} {}/{} to get {}: {}",
                    kind, namespace, name, state, e
                );
            }
            Err(_) => break,
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep_until(std::cmp::min(now + poll_interval, deadline)).await;
    }

    debug!(%reconciliation, "Exceeded timeout of {:?} while waiting for {} {}/{} to be {}", timeout, kind, namespace, name, state);
    Err(OperatorError::Timeout {
        what: state.to_string(),
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    })
}

/// Await every named wait, then succeed only if all of them succeeded.
///
/// Waits are not cancelled when one fails: the result lists every replica
/// that did not become ready.
pub async fn join_all_ready<Fut>(
    namespace: &str,
    name: &str,
    waits: Vec<(String, Fut)>,
) -> Result<(), OperatorError>
where
    Fut: Future<Output = Result<(), OperatorError>>,
{
    let (names, futures): (Vec<String>, Vec<Fut>) = waits.into_iter().unzip();
    let results = join_all(futures).await;

    let unready: Vec<String> = names
        .into_iter()
        .zip(results)
        .filter_map(|(replica, result)| result.err().map(|_| replica))
        .collect();

    if unready.is_empty() {
        Ok(())
    } else {
        Err(OperatorError::ReplicasNotReady {
            namespace: namespace.to_string(),
            name: name.to_string(),
            unready,
        })
    }
}

/// A StatefulSet is ready once the controller observed its latest generation
/// and every desired replica reports ready.
pub fn is_statefulset_ready(sts: &StatefulSet) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or(0);
    let generation = sts.metadata.generation.unwrap_or(0);
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    observed >= generation && status.ready_replicas.unwrap_or(0) >= desired
}

/// A pod is ready when its `Ready` condition is `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
