//! StatefulSet spec diffing and the generation policy built on it.
//!
//! The differ compares the JSON forms of two StatefulSets and classifies every
//! differing path into facets. Paths the desired spec sets are compared, so
//! fields the API server defaults never register as drift. Keys of maps the
//! desired spec owns outright (labels, annotations, node selectors, container
//! resources) are also checked the other way round: a key only the current
//! object carries is reported as removed, so the patch can delete it.

use crate::annotations::ANNO_GENERATION;
use crate::error::OperatorError;
use crate::reconciliation::Reconciliation;
use k8s_openapi::api::apps::v1::StatefulSet;
use serde_json::{Map, Value};
use tracing::{debug, trace};

const REPLICAS: &str = "/spec/replicas";
const LABELS: &str = "/metadata/labels";
const TEMPLATE: &str = "/spec/template";
const VOLUME_CLAIM_TEMPLATES: &str = "/spec/volumeClaimTemplates";

/// Paths populated by the server or owned by this crate, never compared.
const IGNORED: &[&str] = &[
    "/status",
    "/metadata/managedFields",
    "/metadata/resourceVersion",
    "/metadata/uid",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/selfLink",
    "/spec/revisionHistoryLimit",
];

/// Maps whose keys all come from the desired spec; `*` matches a list index.
const OWNED_MAPS: &[&[&str]] = &[
    &["metadata", "labels"],
    &["metadata", "annotations"],
    &["spec", "template", "metadata", "labels"],
    &["spec", "template", "metadata", "annotations"],
    &["spec", "template", "spec", "nodeSelector"],
    &["spec", "template", "spec", "containers", "*", "resources", "limits"],
    &["spec", "template", "spec", "containers", "*", "resources", "requests"],
    &["spec", "template", "spec", "initContainers", "*", "resources", "limits"],
    &["spec", "template", "spec", "initContainers", "*", "resources", "requests"],
];

/// Classified differences between a current and a desired StatefulSet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatefulSetDiff {
    paths: Vec<String>,
    removed: Vec<String>,
    changes_spec_replicas: bool,
    changes_labels: bool,
    changes_spec_template: bool,
    changes_volume_claim_templates: bool,
    changes_volume_size: bool,
}

impl StatefulSetDiff {
    /// Build a diff from JSON-pointer paths, classifying each one.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut diff = Self::default();
        for path in paths {
            diff.record(path.into());
        }
        diff
    }

    /// Add paths present in the current object but no longer set by the
    /// desired one.
    #[must_use]
    pub fn with_removed<I, S>(mut self, removed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in removed {
            let path = path.into();
            self.removed.push(path.clone());
            self.record(path);
        }
        self
    }

    fn record(&mut self, path: String) {
        if under(&path, REPLICAS) {
            self.changes_spec_replicas = true;
        } else if under(&path, LABELS) {
            self.changes_labels = true;
        } else if under(&path, TEMPLATE) {
            self.changes_spec_template = true;
        } else if is_volume_size_path(&path) {
            self.changes_volume_size = true;
        } else if under(&path, VOLUME_CLAIM_TEMPLATES) {
            self.changes_volume_claim_templates = true;
        }
        self.paths.push(path);
    }

    /// True when the specs do not differ on any compared path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Every differing path, as a JSON pointer.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// The subset of [`paths`](Self::paths) the desired spec dropped.
    #[must_use]
    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    /// `spec.replicas` differs.
    #[must_use]
    pub fn changes_spec_replicas(&self) -> bool {
        self.changes_spec_replicas
    }

    /// The StatefulSet's own labels differ.
    #[must_use]
    pub fn changes_labels(&self) -> bool {
        self.changes_labels
    }

    /// The pod template differs (ignoring the generation annotation).
    #[must_use]
    pub fn changes_spec_template(&self) -> bool {
        self.changes_spec_template
    }

    /// Volume claim templates differ in anything other than requested size.
    #[must_use]
    pub fn changes_volume_claim_templates(&self) -> bool {
        self.changes_volume_claim_templates
    }

    /// A volume claim template's requested resources differ.
    #[must_use]
    pub fn changes_volume_size(&self) -> bool {
        self.changes_volume_size
    }

    /// Either facet the cluster refuses to patch in place.
    #[must_use]
    pub fn requires_replace(&self) -> bool {
        self.changes_volume_claim_templates || self.changes_volume_size
    }
}

/// Computes the differences between two StatefulSets.
pub trait SpecDiffer: Send + Sync {
    /// Diff `current` against `desired`.
    fn diff(
        &self,
        reconciliation: &Reconciliation,
        current: &StatefulSet,
        desired: &StatefulSet,
    ) -> Result<StatefulSetDiff, OperatorError>;
}

/// Default differ comparing JSON trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStatefulSetDiffer;

impl SpecDiffer for JsonStatefulSetDiffer {
    fn diff(
        &self,
        reconciliation: &Reconciliation,
        current: &StatefulSet,
        desired: &StatefulSet,
    ) -> Result<StatefulSetDiff, OperatorError> {
        let current = serde_json::to_value(current)?;
        let desired = serde_json::to_value(desired)?;

        let mut paths = Vec::new();
        let mut removed = Vec::new();
        collect_differences("", &current, &desired, &mut paths, &mut removed);

        for path in &paths {
            debug!(%reconciliation, "StatefulSet differs: {}", path);
            trace!(
                %reconciliation,
                "Current value: {}, desired value: {}",
                lookup(&current, path),
                lookup(&desired, path)
            );
        }
        for path in &removed {
            debug!(%reconciliation, "StatefulSet differs: {} removed", path);
        }

        Ok(StatefulSetDiff::from_paths(paths).with_removed(removed))
    }
}

/// Decides whether a diff warrants bumping the generation annotation.
pub trait GenerationPolicy: Send + Sync {
    /// Evaluated once per patch.
    fn should_increment_generation(&self, reconciliation: &Reconciliation, diff: &StatefulSetDiff)
        -> bool;
}

impl<F> GenerationPolicy for F
where
    F: Fn(&Reconciliation, &StatefulSetDiff) -> bool + Send + Sync,
{
    fn should_increment_generation(&self, reconciliation: &Reconciliation, diff: &StatefulSetDiff) -> bool {
        self(reconciliation, diff)
    }
}

/// Bumps the generation whenever the pod template changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateChangePolicy;

impl GenerationPolicy for TemplateChangePolicy {
    fn should_increment_generation(&self, _reconciliation: &Reconciliation, diff: &StatefulSetDiff) -> bool {
        !diff.is_empty() && diff.changes_spec_template()
    }
}

fn collect_differences(
    path: &str,
    current: &Value,
    desired: &Value,
    out: &mut Vec<String>,
    removed: &mut Vec<String>,
) {
    if is_ignored(path) {
        return;
    }
    match desired {
        Value::Null => collect_removals(path, current, removed),
        Value::Object(desired_fields) => {
            for (key, desired_value) in desired_fields {
                let child = format!("{path}/{}", escape(key));
                let current_value = current.get(key).unwrap_or(&Value::Null);
                collect_differences(&child, current_value, desired_value, out, removed);
            }
            if let Value::Object(current_fields) = current {
                for (key, current_value) in current_fields {
                    if !desired_fields.contains_key(key) {
                        let child = format!("{path}/{}", escape(key));
                        collect_removals(&child, current_value, removed);
                    }
                }
            }
        }
        Value::Array(desired_items) => {
            let current_items: &[Value] = current.as_array().map_or(&[], Vec::as_slice);
            if current_items.len() == desired_items.len() {
                for (index, (current_item, desired_item)) in
                    current_items.iter().zip(desired_items).enumerate()
                {
                    let child = format!("{path}/{index}");
                    collect_differences(&child, current_item, desired_item, out, removed);
                }
            } else {
                out.push(path.to_string());
            }
        }
        scalar => {
            if current != scalar {
                out.push(path.to_string());
            }
        }
    }
}

/// `path` is set in current only; report it if it is a key of an owned map.
fn collect_removals(path: &str, current: &Value, removed: &mut Vec<String>) {
    if is_ignored(path) || current.is_null() {
        return;
    }
    match owned_map_scope(path) {
        OwnedMapScope::Entry => removed.push(path.to_string()),
        OwnedMapScope::Leads => match current {
            Value::Object(fields) => {
                for (key, value) in fields {
                    collect_removals(&format!("{path}/{}", escape(key)), value, removed);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    collect_removals(&format!("{path}/{index}"), item, removed);
                }
            }
            _ => {}
        },
        OwnedMapScope::Outside => {}
    }
}

enum OwnedMapScope {
    /// A key inside an owned map
    Entry,
    /// An owned map or one of its ancestors
    Leads,
    Outside,
}

fn owned_map_scope(path: &str) -> OwnedMapScope {
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let matches = |pattern: &[&str]| {
        segments
            .iter()
            .zip(pattern)
            .all(|(segment, expected)| *expected == "*" || segment == expected)
    };
    let mut scope = OwnedMapScope::Outside;
    for pattern in OWNED_MAPS.iter().copied() {
        if segments.len() == pattern.len() + 1 && matches(pattern) {
            return OwnedMapScope::Entry;
        }
        if segments.len() <= pattern.len() && matches(pattern) {
            scope = OwnedMapScope::Leads;
        }
    }
    scope
}

/// Set the value at `pointer` to `null`, creating missing parent objects.
///
/// A strategic merge patch deletes map keys set to `null`.
pub(crate) fn null_at(value: &mut Value, pointer: &str) {
    let mut target = value;
    for token in pointer.split('/').skip(1).map(unescape) {
        target = match target {
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return,
            },
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                match other {
                    Value::Object(fields) => fields.entry(token).or_insert(Value::Null),
                    _ => return,
                }
            }
        };
    }
    *target = Value::Null;
}

fn is_ignored(path: &str) -> bool {
    if IGNORED.iter().any(|prefix| under(path, prefix)) {
        return true;
    }
    let generation = format!("{TEMPLATE}/metadata/annotations/{}", escape(ANNO_GENERATION));
    if path == generation {
        return true;
    }
    // /spec/volumeClaimTemplates/<n>/status
    let segments: Vec<&str> = path.split('/').collect();
    matches!(segments.as_slice(), ["", "spec", "volumeClaimTemplates", _, "status", ..])
}

fn is_volume_size_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    matches!(
        segments.as_slice(),
        ["", "spec", "volumeClaimTemplates", _, "spec", "resources", ..]
    )
}

/// `path` is `prefix` or lies beneath it.
fn under(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

pub(crate) fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn lookup<'a>(value: &'a Value, path: &str) -> &'a Value {
    value.pointer(path).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::with_generation;
    use crate::test_utils::*;

    fn diff(current: &StatefulSet, desired: &StatefulSet) -> StatefulSetDiff {
        let reconciliation = test_reconciliation("web");
        JsonStatefulSetDiffer.diff(&reconciliation, current, desired).unwrap()
    }

    #[test]
    fn test_identical_specs_are_empty() {
        let sts = create_test_statefulset("web", "ns", 3);
        let d = diff(&sts, &sts.clone());
        assert!(d.is_empty(), "unexpected paths: {:?}", d.paths());
        assert!(!d.requires_replace());
    }

    #[test]
    fn test_server_populated_fields_ignored() {
        let desired = create_test_statefulset("web", "ns", 3);
        let mut current = desired.clone();
        current.metadata.resource_version = Some("17".to_string());
        current.metadata.generation = Some(4);
        current.metadata.uid = Some("abc".to_string());
        current.status = Some(ready_status(3, 4));
        current.spec.as_mut().unwrap().revision_history_limit = Some(10);
        // Server defaults on fields desired leaves unset
        current.spec.as_mut().unwrap().pod_management_policy = Some("OrderedReady".to_string());

        let mut desired = desired;
        desired.metadata.resource_version = Some("1".to_string());
        desired.spec.as_mut().unwrap().revision_history_limit = Some(3);

        assert!(diff(&current, &desired).is_empty());
    }

    #[test]
    fn test_generation_annotation_ignored() {
        let current = with_generation(create_test_statefulset("web", "ns", 3), 5);
        let desired = with_generation(create_test_statefulset("web", "ns", 3), 0);
        assert!(diff(&current, &desired).is_empty());
    }

    #[test]
    fn test_replicas_change() {
        let current = create_test_statefulset("web", "ns", 3);
        let desired = create_test_statefulset("web", "ns", 5);
        let d = diff(&current, &desired);
        assert!(d.changes_spec_replicas());
        assert!(!d.changes_spec_template());
        assert_eq!(d.paths(), ["/spec/replicas"]);
    }

    #[test]
    fn test_template_change() {
        let current = create_test_statefulset("web", "ns", 3);
        let desired = with_image(create_test_statefulset("web", "ns", 3), "nginx:1.27");
        let d = diff(&current, &desired);
        assert!(d.changes_spec_template());
        assert!(!d.requires_replace());
        assert_eq!(d.paths(), ["/spec/template/spec/containers/0/image"]);
    }

    #[test]
    fn test_volume_size_change() {
        let current = with_volume_claim("data", "1Gi", create_test_statefulset("web", "ns", 3));
        let desired = with_volume_claim("data", "5Gi", create_test_statefulset("web", "ns", 3));
        let d = diff(&current, &desired);
        assert!(d.changes_volume_size());
        assert!(!d.changes_volume_claim_templates());
        assert!(d.requires_replace());
    }

    #[test]
    fn test_volume_claim_template_added() {
        let current = create_test_statefulset("web", "ns", 3);
        let desired = with_volume_claim("data", "1Gi", create_test_statefulset("web", "ns", 3));
        let d = diff(&current, &desired);
        assert!(d.changes_volume_claim_templates());
        assert!(!d.changes_volume_size());
        assert!(d.requires_replace());
    }

    #[test]
    fn test_label_change() {
        let current = create_test_statefulset("web", "ns", 3);
        let mut desired = current.clone();
        desired
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "backend".to_string());
        let d = diff(&current, &desired);
        assert!(d.changes_labels());
        assert_eq!(d.paths(), ["/metadata/labels/tier"]);
    }

    #[test]
    fn test_dropped_template_annotation_is_removed() {
        let current = with_template_annotation(
            with_generation(create_test_statefulset("web", "ns", 3), 2),
            "restart-hint",
            "x",
        );
        let desired = create_test_statefulset("web", "ns", 3);
        let d = diff(&current, &desired);
        // The generation annotation is never reported
        assert_eq!(d.removed(), ["/spec/template/metadata/annotations/restart-hint"]);
        assert_eq!(d.paths(), d.removed());
        assert!(d.changes_spec_template());
        assert!(!d.requires_replace());
    }

    #[test]
    fn test_dropped_resource_limit_is_removed() {
        let current = with_cpu_limit(create_test_statefulset("web", "ns", 3), "500m");
        let desired = create_test_statefulset("web", "ns", 3);
        let d = diff(&current, &desired);
        assert_eq!(d.removed(), ["/spec/template/spec/containers/0/resources/limits/cpu"]);
    }

    #[test]
    fn test_dropped_label_is_removed() {
        let mut current = create_test_statefulset("web", "ns", 3);
        current
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "backend".to_string());
        let desired = create_test_statefulset("web", "ns", 3);
        let d = diff(&current, &desired);
        assert!(d.changes_labels());
        assert_eq!(d.removed(), ["/metadata/labels/tier"]);
    }

    #[test]
    fn test_server_defaults_are_not_removals() {
        let desired = create_test_statefulset("web", "ns", 3);
        let mut current = desired.clone();
        let pod_spec = current.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod_spec.dns_policy = Some("ClusterFirst".to_string());
        pod_spec.containers[0].image_pull_policy = Some("IfNotPresent".to_string());
        pod_spec.containers[0].termination_message_path = Some("/dev/termination-log".to_string());
        assert!(diff(&current, &desired).is_empty());
    }

    #[test]
    fn test_null_at_creates_parents() {
        let mut body = serde_json::json!({
            "spec": {"template": {"spec": {"containers": [{"name": "app"}]}}}
        });
        null_at(&mut body, "/spec/template/spec/containers/0/resources/limits/cpu");
        null_at(&mut body, "/metadata/annotations/example.com~1hint");
        assert_eq!(
            body.pointer("/spec/template/spec/containers/0/resources/limits"),
            Some(&serde_json::json!({"cpu": null}))
        );
        assert_eq!(
            body.pointer("/metadata/annotations"),
            Some(&serde_json::json!({"example.com/hint": null}))
        );
        // Out-of-range list indices are left alone
        null_at(&mut body, "/spec/template/spec/containers/3/resources");
        assert_eq!(body["spec"]["template"]["spec"]["containers"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_from_paths_classification() {
        let d = StatefulSetDiff::from_paths([
            "/spec/volumeClaimTemplates/0/spec/resources/requests/storage",
            "/spec/volumeClaimTemplates/1/spec/storageClassName",
        ]);
        assert!(d.changes_volume_size());
        assert!(d.changes_volume_claim_templates());
        // Prefix matching respects segment boundaries
        let d = StatefulSetDiff::from_paths(["/spec/replicasOther"]);
        assert!(!d.changes_spec_replicas());
        assert!(!d.is_empty());
    }

    #[test]
    fn test_template_change_policy() {
        let reconciliation = test_reconciliation("web");
        let policy = TemplateChangePolicy;
        assert!(!policy.should_increment_generation(&reconciliation, &StatefulSetDiff::default()));
        assert!(policy.should_increment_generation(
            &reconciliation,
            &StatefulSetDiff::from_paths(["/spec/template/spec/containers/0/image"])
        ));
        assert!(!policy.should_increment_generation(
            &reconciliation,
            &StatefulSetDiff::from_paths(["/metadata/labels/tier"])
        ));
    }

    #[test]
    fn test_closure_policy() {
        let reconciliation = test_reconciliation("web");
        let always = |_: &Reconciliation, _: &StatefulSetDiff| true;
        assert!(always.should_increment_generation(&reconciliation, &StatefulSetDiff::default()));
    }
}
