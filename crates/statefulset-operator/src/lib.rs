//! StatefulSet Operator
//!
//! Reconciles Kubernetes StatefulSets towards a caller-supplied desired spec.
//!
//! # Example
//!
//! ```no_run
//! use statefulset_operator::{OperatorConfig, Reconciliation, StatefulSetOperator, TemplateChangePolicy};
//! use k8s_openapi::api::apps::v1::StatefulSet;
//!
//! # async fn example(desired: StatefulSet) -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let operator = StatefulSetOperator::new(client, OperatorConfig::from_env()?, TemplateChangePolicy);
//!
//! let reconciliation = Reconciliation::new("watch", "StatefulSet", "kafka", "my-cluster-kafka");
//! let result = operator
//!     .reconcile(&reconciliation, "kafka", "my-cluster-kafka", Some(desired))
//!     .await?;
//! if result.is_changed() {
//!     // trigger a rolling restart of outdated pods
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Create**: creates the StatefulSet and waits for it and every replica to be ready
//! - **Patch or replace**: patches in place, or deletes and recreates when volume
//!   claim templates change
//! - **Generation tracking**: a template annotation bumped on meaningful changes
//! - **Async delete**: deletes on a bounded worker pool

pub mod annotations;
pub mod config;
pub mod diff;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod operator;
pub mod pods;
pub mod pool;
pub mod readiness;
pub mod reconciliation;
pub mod resource;
#[cfg(test)]
mod test_utils;

pub use annotations::{ANNO_GENERATION, INIT_GENERATION, NO_GENERATION};
pub use config::OperatorConfig;
pub use diff::{GenerationPolicy, JsonStatefulSetDiffer, SpecDiffer, StatefulSetDiff, TemplateChangePolicy};
pub use error::OperatorError;
pub use operator::{ReconcileResult, StatefulSetOperator};
pub use pods::{KubePods, PodOperations};
pub use pool::WorkerPool;
pub use reconciliation::Reconciliation;
pub use resource::{DeletionPropagation, KubeStatefulSets, StatefulSetOperations};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockPods, MockStatefulSets};
