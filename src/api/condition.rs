use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The condition type this controller owns.
pub const SUBSCRIPTION_ACTIVE: &str = "Subscription active";

/// Condition types of the Subscription CRD.
///
/// The CRD is shared by every eventing backend, so types written by other
/// controllers are kept verbatim in [`ConditionType::Other`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    SubscriptionActive,
    Other(String),
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        if value == SUBSCRIPTION_ACTIVE {
            Self::SubscriptionActive
        } else {
            Self::Other(value)
        }
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::SubscriptionActive => SUBSCRIPTION_ACTIVE.to_owned(),
            ConditionType::Other(other) => other,
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionActive => f.write_str(SUBSCRIPTION_ACTIVE),
            Self::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

const NATS_SUBSCRIPTION_ACTIVE: &str = "NATS Subscription active";
const NATS_SUBSCRIPTION_NOT_ACTIVE: &str = "NATS Subscription not active";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ConditionReason {
    NatsSubscriptionActive,
    NatsSubscriptionNotActive,
    Other(String),
}

impl From<String> for ConditionReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            NATS_SUBSCRIPTION_ACTIVE => Self::NatsSubscriptionActive,
            NATS_SUBSCRIPTION_NOT_ACTIVE => Self::NatsSubscriptionNotActive,
            _ => Self::Other(value),
        }
    }
}

impl From<ConditionReason> for String {
    fn from(value: ConditionReason) -> Self {
        match value {
            ConditionReason::NatsSubscriptionActive => NATS_SUBSCRIPTION_ACTIVE.to_owned(),
            ConditionReason::NatsSubscriptionNotActive => NATS_SUBSCRIPTION_NOT_ACTIVE.to_owned(),
            ConditionReason::Other(other) => other,
        }
    }
}

/// A typed status entry summarizing one aspect of a Subscription's health.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub reason: Option<ConditionReason>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    /// The `Subscription active` condition for the outcome of a NATS sync.
    pub fn subscription_active(active: bool, message: impl Into<String>) -> Self {
        let reason = if active {
            ConditionReason::NatsSubscriptionActive
        } else {
            ConditionReason::NatsSubscriptionNotActive
        };
        Self {
            type_: ConditionType::SubscriptionActive,
            status: active.into(),
            reason: Some(reason),
            message: message.into(),
        }
    }
}

/// Merges `condition` into `current`.
///
/// The entry of the same type is replaced in place; other entries keep their relative order.
/// If no entry of that type exists, `condition` is appended.
pub fn merge(current: &[Condition], condition: Condition) -> Vec<Condition> {
    let condition_type = condition.type_.clone();
    let mut merged = Vec::with_capacity(current.len() + 1);
    let mut pending = Some(condition);
    for existing in current {
        if existing.type_ != condition_type {
            merged.push(existing.clone());
        } else if let Some(condition) = pending.take() {
            merged.push(condition);
        }
        // later entries of the merged type are dropped
    }
    merged.extend(pending);
    merged
}
