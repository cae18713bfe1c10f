use std::sync::Arc;

use futures::stream;
use kube_client::{Api, Client};
use kube_runtime::watcher;
use tokio_util::sync::CancellationToken;

use crate::application;
use crate::backend::{MessagingBackend, NatsBackend};
use crate::client::KubeSubscriptionClient;
use crate::config::Config;
use crate::eventtype::EventTypeCleaner;
use crate::reconciler::SubscriptionReconciler;
use crate::runner::{self, RunError};
use crate::subscriber;

/// Runs the NATS Subscription controller until `shutdown` is cancelled.
///
/// Fails immediately if the NATS server cannot be reached; the caller is expected to exit.
pub async fn run(client: Client, config: Config, shutdown: CancellationToken) -> Result<(), RunError> {
    let backend = NatsBackend::new(config.nats.clone(), config.subscription_defaults.clone())?;
    if let Err(err) = backend.initialize().await {
        log::error!("start reconciler failed: {err}");
        return Err(err.into());
    }
    let reconnects = backend.reconnects();

    let (applications, applications_driver) = application::lister(Api::all(client.clone()));
    let applications_task = tokio::spawn(applications_driver);

    let cleaner = EventTypeCleaner::new(config.nats.event_type_prefix.clone(), Some(applications));
    let reconciler = Arc::new(SubscriptionReconciler::new(
        KubeSubscriptionClient::new(client.clone()),
        backend,
        cleaner,
        config.broker_pod.clone(),
    ));

    let (subscriptions, subscription_requests) =
        subscriber::subscriptions(Api::all(client.clone()), watcher::Config::default());
    let requests = stream::select(
        stream::select(
            subscription_requests,
            subscriber::broker_pod(
                Api::namespaced(client, &config.broker_pod.namespace),
                config.broker_pod.clone(),
            ),
        ),
        subscriber::resync_all(subscriptions, reconnects),
    );

    log::info!(
        "starting NATS subscription controller with {} worker(s)",
        config.runner.workers
    );
    let result = runner::run(reconciler, requests, &config.runner, shutdown).await;
    applications_task.abort();
    result
}
