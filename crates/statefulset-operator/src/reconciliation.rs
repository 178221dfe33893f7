//! Reconciliation identity used as the logging key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one reconcile pass over one resource.
///
/// Every log record emitted on behalf of a pass carries this as the
/// `reconciliation` field, so interleaved passes can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    id: u64,
    trigger: String,
    kind: String,
    namespace: String,
    name: String,
}

impl Reconciliation {
    /// Start a new reconciliation with a process-unique id.
    pub fn new(
        trigger: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            trigger: trigger.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The numeric id of this pass.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What caused this pass (e.g. "watch", "timer").
    #[must_use]
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Kind of the resource being reconciled.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Namespace of the resource being reconciled.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the resource being reconciled.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reconciliation #{}({}) {}({}/{})",
            self.id, self.trigger, self.kind, self.namespace, self.name
        )
    }
}
