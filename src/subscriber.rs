//! Watch sources feeding reconcile requests into the work queue.

use std::fmt;

use kube_core::Resource;

/// Uniquely identifies a namespaced object by namespace and name.
///
/// This is the work queue key: a Subscription reconcile request,
/// or the sentinel for the broker pod.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    /// The object namespace
    pub namespace: String,
    /// The object name
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns `None` for objects without a name or namespace.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        let meta = resource.meta();
        Some(Self {
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub mod subscriptions;
pub use subscriptions::{resync_all, subscriptions};

pub mod pods;
pub use pods::broker_pod;
