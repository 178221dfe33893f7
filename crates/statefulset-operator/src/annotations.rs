//! Generation annotation codec.
//!
//! The generation marker lives on the pod template metadata of a StatefulSet
//! (and therefore on every pod created from it). Rolling-restart logic compares
//! the pod's value with the StatefulSet's to find pods running an outdated
//! template.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Annotation key holding the template generation.
pub const ANNO_GENERATION: &str = "statefulset-operator.io/generation";

/// Generation of an absent resource, or of one without the annotation.
pub const NO_GENERATION: i64 = -1;

/// Generation assigned when a StatefulSet is first created.
pub const INIT_GENERATION: i64 = 0;

/// Read an integer annotation, returning `default` when absent or unparseable.
pub fn int_annotation(meta: Option<&ObjectMeta>, key: &str, default: i64) -> i64 {
    meta.and_then(|m| m.annotations.as_ref())
        .and_then(|annotations| annotations.get(key))
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

/// Generation annotation of the StatefulSet's pod template, or `default`.
pub fn read_generation(sts: &StatefulSet, default: i64) -> i64 {
    let meta = sts.spec.as_ref().and_then(|spec| spec.template.metadata.as_ref());
    int_annotation(meta, ANNO_GENERATION, default)
}

/// Set the generation annotation on the pod template in place.
pub fn set_generation(sts: &mut StatefulSet, generation: i64) {
    sts.spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNO_GENERATION.to_string(), generation.to_string());
}

/// Return `sts` carrying the given generation.
#[must_use]
pub fn with_generation(mut sts: StatefulSet, generation: i64) -> StatefulSet {
    set_generation(&mut sts, generation);
    sts
}

/// Generation of a possibly-absent StatefulSet; [`NO_GENERATION`] when absent.
pub fn sts_generation(sts: Option<&StatefulSet>) -> i64 {
    sts.map_or(NO_GENERATION, |s| read_generation(s, NO_GENERATION))
}

/// Generation a pod was created from; [`NO_GENERATION`] when absent.
pub fn pod_generation(pod: Option<&Pod>) -> i64 {
    pod.map_or(NO_GENERATION, |p| {
        int_annotation(Some(&p.metadata), ANNO_GENERATION, NO_GENERATION)
    })
}
