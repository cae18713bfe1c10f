use std::{future::Future, panic, pin::pin, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use kube_runtime::watcher;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend;
use crate::config::RunnerConfig;
use crate::queue::WorkQueue;
use crate::subscriber::NamespacedName;

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing until the next watch event.
    AwaitChange,
    /// Reconcile again soon, with backoff.
    Requeue,
    /// Reconcile again once the delay has passed.
    RequeueAfter(Duration),
}

/// The per-key reconcile function driven by [`run`].
pub trait Reconcile: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    fn reconcile(
        &self,
        req: &NamespacedName,
    ) -> impl Future<Output = Result<Action, Self::Error>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("initialize messaging backend failed: {0}")]
    Initialize(#[from] backend::Error),
    #[error("all watch sources ended")]
    SourcesClosed,
}

/// Feeds `requests` into a work queue drained by `config.workers` workers until `shutdown`.
///
/// Failed reconciles and [`Action::Requeue`] are retried with exponential backoff per key.
/// Watch errors are logged; the watchers recover on their own.
pub async fn run<R, S>(
    reconciler: Arc<R>,
    requests: S,
    config: &RunnerConfig,
    shutdown: CancellationToken,
) -> Result<(), RunError>
where
    R: Reconcile,
    S: Stream<Item = Result<NamespacedName, watcher::Error>>,
{
    let queue = Arc::new(WorkQueue::new(config.base_backoff, config.max_backoff));

    let mut workers = JoinSet::new();
    for _ in 0..config.workers.max(1) {
        workers.spawn(work(
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            config.reconcile_timeout,
            shutdown.clone(),
        ));
    }

    let mut requests = pin!(requests);
    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            request = requests.next() => match request {
                Some(Ok(key)) => queue.add(key),
                Some(Err(err)) => log::warn!("watch failed: {err}"),
                None => break Err(RunError::SourcesClosed),
            },
        }
    };

    queue.shut_down();
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }

    result
}

async fn work<R: Reconcile>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<NamespacedName>>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    while let Some(key) = queue.get().await {
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                queue.done(&key);
                break;
            }
            outcome = reconcile_once(&*reconciler, &key, timeout) => outcome,
        };

        match outcome {
            Some(Action::AwaitChange) => queue.forget(&key),
            Some(Action::Requeue) => queue.add_rate_limited(key.clone()),
            Some(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            None => queue.add_rate_limited(key.clone()),
        }
        queue.done(&key);
    }
}

/// Returns `None` if the reconcile failed or timed out.
async fn reconcile_once<R: Reconcile>(
    reconciler: &R,
    key: &NamespacedName,
    timeout: Option<Duration>,
) -> Option<Action> {
    let reconcile = reconciler.reconcile(key);
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, reconcile).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("reconcile {key} timed out after {limit:?}");
                return None;
            }
        },
        None => reconcile.await,
    };
    outcome
        .map_err(|err| log::error!("reconcile {key} failed: {err}"))
        .ok()
}
