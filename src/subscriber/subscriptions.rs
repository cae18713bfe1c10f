use futures::{future, stream, Stream, StreamExt, TryStreamExt};
use kube_client::Api;
use kube_runtime::{reflector, reflector::Store, watcher, WatchStreamExt};

use super::NamespacedName;
use crate::api::Subscription;

/// Requests a reconcile for every Subscription created, updated or deleted.
///
/// The returned store mirrors the watched Subscriptions for [`resync_all`].
pub fn subscriptions(
    api: Api<Subscription>,
    watcher_config: watcher::Config,
) -> (
    Store<Subscription>,
    impl Stream<Item = Result<NamespacedName, watcher::Error>>,
) {
    let writer = reflector::store::Writer::default();
    let store = writer.as_reader();
    let requests = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .touched_objects()
        .try_filter_map(|sub| future::ready(Ok(NamespacedName::from_resource(&sub))));
    (store, requests)
}

/// Requests a reconcile for every known Subscription each time `signals` yields.
pub fn resync_all(
    store: Store<Subscription>,
    signals: impl Stream<Item = ()>,
) -> impl Stream<Item = Result<NamespacedName, watcher::Error>> {
    signals.flat_map(move |()| {
        let keys: Vec<_> = store
            .state()
            .iter()
            .filter_map(|sub| NamespacedName::from_resource(&**sub))
            .map(Ok)
            .collect();
        log::info!("requeueing {} subscription(s)", keys.len());
        stream::iter(keys)
    })
}
