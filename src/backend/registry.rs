//! The table of queue group members owned by Subscriptions.
//!
//! Each member is a delivery task draining one broker subscription. The
//! table knows nothing about the broker client: new members are obtained
//! through a `subscribe` callback and delivered through a [`Delivery`].

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::Arc,
};

use async_nats::Message;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BoxError, Error};
use crate::subscriber::NamespacedName;

/// A broker subscription as seen by a delivery task.
pub trait MessageSource: Stream<Item = Message> + Unpin + Send + 'static {
    fn unsubscribe(&mut self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl MessageSource for async_nats::Subscriber {
    async fn unsubscribe(&mut self) -> Result<(), BoxError> {
        async_nats::Subscriber::unsubscribe(self)
            .await
            .map_err(Into::into)
    }
}

/// Forwards a received message on behalf of a Subscription.
pub trait Delivery: Send + Sync + 'static {
    fn deliver(&self, owner: &NamespacedName, message: Message) -> impl Future<Output = ()> + Send;
}

#[derive(Default)]
pub struct Registry {
    registrations: HashMap<String, Registration>,
}

impl Registry {
    /// Ensures `max` live members of `owner`'s queue group on `subject`.
    ///
    /// Members beyond `max` left from a previous sync with `previous` members are
    /// torn down, live members are kept and ended ones are replaced.
    /// Returns whether any member was created.
    pub async fn ensure_members<S, D, F, Fut>(
        &mut self,
        owner: &NamespacedName,
        subject: &str,
        previous: Option<usize>,
        max: usize,
        delivery: &Arc<D>,
        mut subscribe: F,
    ) -> Result<bool, Error>
    where
        S: MessageSource,
        D: Delivery,
        F: FnMut(String, String) -> Fut,
        Fut: Future<Output = Result<S, Error>>,
    {
        self.remove_surplus(owner, subject, previous, max).await?;

        let mut created = false;
        for member in 0..max {
            let key = registration_key(owner, subject, member);
            if let Some(existing) = self.registrations.get(&key) {
                if existing.is_valid() {
                    log::debug!("skipping NATS subscription {key}: already exists");
                    continue;
                }
                if let Some(stale) = self.registrations.remove(&key) {
                    stale.teardown().await?;
                }
            }

            let source = subscribe(subject.to_owned(), queue_group(owner, subject)).await?;
            let registration =
                Registration::spawn(owner.clone(), subject.to_owned(), source, Arc::clone(delivery));
            self.registrations.insert(key, registration);
            created = true;
        }
        Ok(created)
    }

    async fn remove_surplus(
        &mut self,
        owner: &NamespacedName,
        subject: &str,
        previous: Option<usize>,
        max: usize,
    ) -> Result<(), Error> {
        let Some(previous) = previous.filter(|previous| *previous > max) else {
            return Ok(());
        };

        log::info!(
            "deleting extra NATS subscriptions of {owner} on {subject}: maxInFlight reduced from {previous} to {max}"
        );
        for member in (max..previous).rev() {
            if let Some(registration) = self.registrations.remove(&registration_key(owner, subject, member)) {
                registration.teardown().await?;
            }
        }
        Ok(())
    }

    /// Tears down every member owned by `owner`.
    pub async fn remove_owner(&mut self, owner: &NamespacedName) -> Result<(), Error> {
        let keys: Vec<String> = self
            .registrations
            .iter()
            .filter(|(_, registration)| registration.owner == *owner)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(registration) = self.registrations.remove(&key) {
                registration.teardown().await?;
                log::info!("unsubscribe succeeded: {key}");
            }
        }
        Ok(())
    }

    /// Owners with at least one member whose delivery task has ended.
    pub fn invalid(&self) -> Vec<NamespacedName> {
        let invalid: BTreeSet<NamespacedName> = self
            .registrations
            .iter()
            .filter(|(_, registration)| !registration.is_valid())
            .map(|(key, registration)| {
                log::debug!(
                    "invalid NATS subscription {key} on subject {}",
                    registration.subject
                );
                registration.owner.clone()
            })
            .collect();
        invalid.into_iter().collect()
    }
}

/// One queue group member delivering events of `subject` to `owner`'s sink.
struct Registration {
    owner: NamespacedName,
    subject: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

impl Registration {
    fn spawn<S: MessageSource, D: Delivery>(
        owner: NamespacedName,
        subject: String,
        mut source: S,
        delivery: Arc<D>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let owner = owner.clone();
            let subject = subject.clone();

            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        message = source.next() => message,
                    };
                    let Some(message) = message else {
                        log::warn!("NATS subscription of {owner} on {subject} closed");
                        return Ok(());
                    };

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = delivery.deliver(&owner, message) => {}
                    }
                }

                source
                    .unsubscribe()
                    .await
                    .map_err(|source| Error::Unsubscribe { subject, source })
            }
        });

        Self {
            owner,
            subject,
            cancel,
            task,
        }
    }

    /// A registration is live while its delivery task is running.
    fn is_valid(&self) -> bool {
        !self.task.is_finished()
    }

    async fn teardown(self) -> Result<(), Error> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                log::error!(
                    "delivery task of {} on {} failed: {err}",
                    self.owner,
                    self.subject
                );
                Ok(())
            }
        }
    }
}

/// Queue groups are unique per Subscription and subject.
fn queue_group(owner: &NamespacedName, subject: &str) -> String {
    format!("{owner}/{subject}")
}

fn registration_key(owner: &NamespacedName, subject: &str, member: usize) -> String {
    format!("{owner}.{subject}/{member}")
}
