//! Messaging backends holding the live registrations of Subscriptions.

use std::future::Future;

use crate::api::Subscription;
use crate::eventtype::{self, Cleaner};
use crate::subscriber::NamespacedName;

pub mod dispatch;
pub mod nats;
mod registry;
pub use nats::NatsBackend;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A broker connection plus the registrations created for Subscriptions.
///
/// Implementations are shared by all reconcile workers and must tolerate
/// concurrent calls for different Subscriptions.
pub trait MessagingBackend: Send + Sync {
    /// Connects to the broker unless a live connection exists.
    fn initialize(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// (Re)creates the registrations of `sub` and records the applied
    /// subjects and config in its status.
    ///
    /// Returns whether any registration was created. Must be safe to call
    /// right after [`delete_subscription`](Self::delete_subscription) for the same key.
    fn sync_subscription<C: Cleaner + Sync>(
        &self,
        sub: &mut Subscription,
        cleaner: &C,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Tears down every registration of `sub`. Succeeds if there are none.
    fn delete_subscription(&self, sub: &Subscription)
        -> impl Future<Output = Result<(), Error>> + Send;

    /// Best-effort snapshot of Subscriptions whose registrations are no longer live.
    fn invalid_subscriptions(&self) -> impl Future<Output = Vec<NamespacedName>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connect to NATS failed: {0}")]
    Connect(#[source] BoxError),
    #[error("build HTTP client failed: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("subscription has no name or namespace")]
    MissingName,
    #[error("nats: invalid subject {0:?}")]
    BadSubject(String),
    #[error("clean event type failed: {0}")]
    CleanEventType(#[from] eventtype::Error),
    #[error("create NATS subscription on subject {subject:?} failed: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BoxError,
    },
    #[error("unsubscribe from subject {subject:?} failed: {source}")]
    Unsubscribe {
        subject: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Errors that only a change of the Subscription can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::MissingName | Self::BadSubject(_) | Self::CleanEventType(_)
        )
    }
}

/// Computes the NATS subjects of `sub`'s unique filters, in filter order.
pub fn clean_subjects(sub: &Subscription, cleaner: &impl Cleaner) -> Result<Vec<String>, Error> {
    sub.spec
        .unique_filters()
        .into_iter()
        .map(|filter| {
            let event_type = filter.event_type.trim();
            if event_type.is_empty() || event_type.contains(char::is_whitespace) {
                return Err(Error::BadSubject(event_type.to_owned()));
            }
            Ok(cleaner.clean(event_type)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EventFilter, SubscriptionSpec};

    struct Identity;

    impl Cleaner for Identity {
        fn clean(&self, event_type: &str) -> Result<String, eventtype::Error> {
            Ok(event_type.to_owned())
        }
    }

    fn sub_with(event_types: &[&str]) -> Subscription {
        Subscription::new(
            "sub",
            SubscriptionSpec {
                sink: "http://sink.default.svc.cluster.local".to_owned(),
                filter: event_types
                    .iter()
                    .map(|event_type| EventFilter {
                        source: String::new(),
                        event_type: (*event_type).to_owned(),
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn subjects_follow_unique_filters() {
        let sub = sub_with(&["a.b.c.v1", " d.e.f.v1 ", "a.b.c.v1"]);
        let subjects = clean_subjects(&sub, &Identity).unwrap();
        assert_eq!(subjects, vec!["a.b.c.v1".to_owned(), "d.e.f.v1".to_owned()]);
    }

    #[test]
    fn empty_event_type_is_a_bad_subject() {
        let err = clean_subjects(&sub_with(&["a.b.c.v1", "  "]), &Identity).unwrap_err();
        assert!(matches!(err, Error::BadSubject(_)));
        assert!(err.is_permanent());
        assert!(err.to_string().contains("invalid subject"));
    }

    #[test]
    fn whitespace_in_event_type_is_a_bad_subject() {
        let err = clean_subjects(&sub_with(&["a.b c.v1"]), &Identity).unwrap_err();
        assert!(matches!(err, Error::BadSubject(_)));
    }
}
