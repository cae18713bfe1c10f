//! The Subscription reconcile loop.
//!
//! Each reconcile tears down every NATS registration of the Subscription and
//! recreates it from the current spec, so a partially applied filter or config
//! change never survives. The finalizer is persisted before the first
//! registration exists and removed only after the registrations are gone.

use crate::api::{condition, Condition, Subscription, SubscriptionStatus};
use crate::backend::{self, MessagingBackend};
use crate::client::SubscriptionClient;
use crate::eventtype::Cleaner;
use crate::runner::{Action, Reconcile};
use crate::subscriber::NamespacedName;

/// Status message of Subscriptions whose registrations were lost on the broker.
pub const INVALID_SUBSCRIPTION_MESSAGE: &str = "invalid subscription";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("get subscription failed: {0}")]
    Get(#[source] kube_client::Error),
    #[error("add finalizer to subscription failed: {0}")]
    AddFinalizer(#[source] kube_client::Error),
    #[error("remove finalizer from subscription failed: {0}")]
    RemoveFinalizer(#[source] kube_client::Error),
    #[error("update subscription status failed: {0}")]
    UpdateStatus(#[source] kube_client::Error),
    #[error("delete NATS subscriptions failed: {0}")]
    Delete(#[source] backend::Error),
    #[error("sync NATS subscriptions failed: {0}")]
    Sync(#[source] backend::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("parse {sink:?}: invalid URI for request: {source}")]
    Parse {
        sink: String,
        #[source]
        source: url::ParseError,
    },
    #[error("parse {0:?}: invalid URI for request: sink URL scheme should be 'http' or 'https'")]
    Scheme(String),
}

/// Checks that `sink` is an absolute `http` or `https` URL.
pub fn validate_sink(sink: &str) -> Result<url::Url, SinkError> {
    let url = url::Url::parse(sink).map_err(|source| SinkError::Parse {
        sink: sink.to_owned(),
        source,
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SinkError::Scheme(sink.to_owned()));
    }
    Ok(url)
}

pub struct SubscriptionReconciler<C, B, E> {
    client: C,
    backend: B,
    cleaner: E,
    broker_pod: NamespacedName,
}

impl<C, B, E> SubscriptionReconciler<C, B, E>
where
    C: SubscriptionClient,
    B: MessagingBackend,
    E: Cleaner + Send + Sync,
{
    /// `broker_pod` is the sentinel key requesting [`invalidate_stale_subscriptions`](Self::invalidate_stale_subscriptions).
    pub fn new(client: C, backend: B, cleaner: E, broker_pod: NamespacedName) -> Self {
        Self {
            client,
            backend,
            cleaner,
            broker_pod,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn reconcile_subscription(&self, req: &NamespacedName) -> Result<Action, Error> {
        log::debug!("received subscription reconciliation request {req}");

        let Some(actual) = self.client.get(req).await.map_err(Error::Get)? else {
            return Ok(Action::AwaitChange);
        };
        let mut desired = actual.clone();

        if desired.is_being_deleted() {
            if desired.has_finalizer() {
                if let Err(err) = self.backend.delete_subscription(&desired).await {
                    log::error!("delete subscription {req} failed: {err}");
                    return Err(Error::Delete(err));
                }

                desired.remove_finalizer();
                if let Err(err) = self.client.update(&desired).await {
                    log::error!("remove finalizer from subscription {req} failed: {err}");
                    return Err(Error::RemoveFinalizer(err));
                }
                log::debug!("remove finalizer from subscription {req} succeeded");
            }
            return Ok(Action::AwaitChange);
        }

        if let Err(err) = validate_sink(&actual.spec.sink) {
            log::error!("parse sink URL of subscription {req} failed: {err}");
            self.sync_status(&actual, actual.status_or_default(), false, err.to_string())
                .await?;
            // no point in retrying until the sink is fixed
            return Ok(Action::AwaitChange);
        }

        if let Err(err) = self.backend.delete_subscription(&desired).await {
            log::error!("delete subscription {req} failed: {err}");
            self.sync_status(&actual, actual.status_or_default(), false, err.to_string())
                .await?;
            return Err(Error::Delete(err));
        }

        if !desired.has_finalizer() {
            desired.add_finalizer();
            if let Err(err) = self.client.update(&desired).await {
                log::error!("add finalizer to subscription {req} failed: {err}");
                return Err(Error::AddFinalizer(err));
            }
            log::debug!("add finalizer to subscription {req} succeeded");
            return Ok(Action::Requeue);
        }

        if let Err(err) = self.backend.sync_subscription(&mut desired, &self.cleaner).await {
            log::error!("sync subscription {req} failed: {err}");
            self.sync_status(&actual, actual.status_or_default(), false, err.to_string())
                .await?;
            if err.is_permanent() {
                return Ok(Action::AwaitChange);
            }
            return Err(Error::Sync(err));
        }
        log::debug!("create NATS subscriptions for {req} succeeded");

        let applied = desired.status_or_default();
        let mut status = actual.status_or_default();
        status.clean_event_types = applied.clean_event_types;
        status.config = applied.config;
        self.sync_status(&actual, status, true, String::new()).await?;

        Ok(Action::AwaitChange)
    }

    /// Marks every Subscription the backend reports as invalid not active.
    ///
    /// The status write triggers a regular reconcile of each Subscription,
    /// which recreates its registrations.
    pub async fn invalidate_stale_subscriptions(&self) -> Result<(), Error> {
        for key in self.backend.invalid_subscriptions().await {
            log::debug!("found invalid subscription {key}");
            let sub = match self.client.get(&key).await {
                Ok(Some(sub)) => sub,
                Ok(None) => {
                    log::debug!("invalid subscription {key} no longer exists");
                    continue;
                }
                Err(err) => {
                    log::error!("get invalid subscription {key} failed: {err}");
                    continue;
                }
            };

            if let Err(err) = self
                .sync_status(
                    &sub,
                    sub.status_or_default(),
                    false,
                    INVALID_SUBSCRIPTION_MESSAGE.to_owned(),
                )
                .await
            {
                log::error!("sync status of invalid subscription {key} failed: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Writes `status` with the merged `Subscription active` condition,
    /// unless it equals the status of `actual`.
    async fn sync_status(
        &self,
        actual: &Subscription,
        mut status: SubscriptionStatus,
        ready: bool,
        message: String,
    ) -> Result<(), Error> {
        status.conditions = condition::merge(
            &status.conditions,
            Condition::subscription_active(ready, message),
        );
        status.ready = ready;

        if actual.status_or_default() == status {
            return Ok(());
        }

        let mut desired = actual.clone();
        desired.status = Some(status);
        self.client
            .update_status(&desired)
            .await
            .map_err(Error::UpdateStatus)?;
        Ok(())
    }
}

impl<C, B, E> Reconcile for SubscriptionReconciler<C, B, E>
where
    C: SubscriptionClient + 'static,
    B: MessagingBackend + 'static,
    E: Cleaner + Send + Sync + 'static,
{
    type Error = Error;

    async fn reconcile(&self, req: &NamespacedName) -> Result<Action, Error> {
        if *req == self.broker_pod {
            log::debug!("received watch request for broker pod {req}");
            self.invalidate_stale_subscriptions().await?;
            return Ok(Action::AwaitChange);
        }
        self.reconcile_subscription(req).await
    }
}
