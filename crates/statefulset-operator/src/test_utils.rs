//! Test utilities for unit testing the operator
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::reconciliation::Reconciliation;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    ResourceRequirements, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

/// Install a test-friendly tracing subscriber (idempotent)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to create a reconciliation for a StatefulSet in the test namespace
pub fn test_reconciliation(name: &str) -> Reconciliation {
    Reconciliation::new("test", "StatefulSet", "ns", name)
}

/// Helper to create a minimal StatefulSet with one container
pub fn create_test_statefulset(name: &str, namespace: &str, replicas: i32) -> StatefulSet {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("nginx:1.25".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Replace the first container's image
pub fn with_image(mut sts: StatefulSet, image: &str) -> StatefulSet {
    if let Some(container) = sts
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
    {
        container.image = Some(image.to_string());
    }
    sts
}

/// Add an annotation to the pod template
pub fn with_template_annotation(mut sts: StatefulSet, key: &str, value: &str) -> StatefulSet {
    if let Some(spec) = sts.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }
    sts
}

/// Set a CPU limit on the first container
pub fn with_cpu_limit(mut sts: StatefulSet, cpu: &str) -> StatefulSet {
    if let Some(container) = sts
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
    {
        container
            .resources
            .get_or_insert_with(ResourceRequirements::default)
            .limits
            .get_or_insert_with(BTreeMap::new)
            .insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    sts
}

/// Append a volume claim template requesting `size` of storage
pub fn with_volume_claim(claim_name: &str, size: &str, mut sts: StatefulSet) -> StatefulSet {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    };

    if let Some(spec) = sts.spec.as_mut() {
        spec.volume_claim_templates.get_or_insert_with(Vec::new).push(claim);
    }
    sts
}

/// Status reporting every replica ready at the given generation
pub fn ready_status(replicas: i32, observed_generation: i64) -> StatefulSetStatus {
    StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        observed_generation: Some(observed_generation),
        ..Default::default()
    }
}
