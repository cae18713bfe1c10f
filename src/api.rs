//! The `Subscription` custom resource.

use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod condition;
pub use condition::{Condition, ConditionReason, ConditionStatus, ConditionType};

use crate::config::DefaultSubscriptionConfig;

/// API group of the Subscription resource.
///
/// Doubles as the finalizer this controller places on every Subscription it owns.
pub const GROUP: &str = "eventing.kyma-project.io";

/// The finalizer blocking removal of a Subscription until its NATS registrations are gone.
pub const FINALIZER: &str = GROUP;

/// Desired state of a Subscription.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "eventing.kyma-project.io",
    version = "v1alpha1",
    kind = "Subscription",
    namespaced,
    status = "SubscriptionStatus",
    derive = "PartialEq",
    crates(kube_core = "::kube_core")
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// The HTTP endpoint matching events are delivered to.
    pub sink: String,
    /// The delivery protocol requested by the user.
    #[serde(default)]
    pub protocol: String,
    /// Ordered event filters; each one becomes a NATS subject.
    #[serde(default)]
    pub filter: Vec<EventFilter>,
    /// Per-subscription overrides of the delivery defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SubscriptionConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub source: String,
    pub event_type: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub max_in_flight_messages: i32,
}

impl SubscriptionConfig {
    /// Fills unset (non-positive) values of `config` from `defaults`.
    pub fn merge(config: Option<&SubscriptionConfig>, defaults: &DefaultSubscriptionConfig) -> Self {
        let mut merged = config.copied().unwrap_or_default();
        if merged.max_in_flight_messages < 1 {
            merged.max_in_flight_messages = defaults.max_in_flight_messages;
        }
        merged
    }
}

/// Observed state of a Subscription.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// The NATS subjects derived from `spec.filter` at the last successful sync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clean_event_types: Vec<String>,
    /// The effective config applied at the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SubscriptionConfig>,
}

impl SubscriptionStatus {
    pub fn find_condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == condition_type)
    }
}

impl SubscriptionSpec {
    /// Returns the filters with duplicates removed, keeping the first occurrence of each.
    pub fn unique_filters(&self) -> Vec<&EventFilter> {
        let mut unique: Vec<&EventFilter> = Vec::with_capacity(self.filter.len());
        for filter in &self.filter {
            if !unique.contains(&filter) {
                unique.push(filter);
            }
        }
        unique
    }
}

impl Subscription {
    pub fn has_finalizer(&self) -> bool {
        self.finalizer_count() > 0
    }

    pub fn finalizer_count(&self) -> usize {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|finalizer| *finalizer == FINALIZER)
            .count()
    }

    /// Appends [`FINALIZER`] unless it is already present.
    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_owned());
        }
    }

    /// Removes every occurrence of [`FINALIZER`].
    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != FINALIZER);
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn status_or_default(&self) -> SubscriptionStatus {
        self.status.clone().unwrap_or_default()
    }
}
