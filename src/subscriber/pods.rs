//! Watches the NATS server pod for restarts.
//!
//! A restart of the broker process can drop registrations the client cannot
//! re-establish on its own. Every create or delete of the broker pod is turned
//! into a request keyed by the pod's own name, which the reconciler treats as
//! "resync all invalid subscriptions".

use std::collections::HashMap;

use futures::{stream, Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube_client::Api;
use kube_runtime::{watcher, WatchStreamExt};

use super::NamespacedName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Create,
    Update,
    Delete,
}

/// Accepts create and delete events of exactly one pod.
#[derive(Debug, Clone)]
pub struct BrokerPodPredicate {
    identity: NamespacedName,
}

impl BrokerPodPredicate {
    pub fn new(identity: NamespacedName) -> Self {
        Self { identity }
    }

    pub fn accepts(&self, kind: PodEventKind, pod: &NamespacedName) -> bool {
        match kind {
            PodEventKind::Create | PodEventKind::Delete => *pod == self.identity,
            PodEventKind::Update => false,
        }
    }
}

/// Turns level-based watcher events into create/update/delete edges.
///
/// A pod seen again under a new UID counts as created.
#[derive(Debug, Default)]
pub struct PodTracker {
    known: HashMap<NamespacedName, Option<String>>,
}

impl PodTracker {
    pub fn classify(&mut self, event: watcher::Event<Pod>) -> Vec<(PodEventKind, NamespacedName)> {
        match event {
            watcher::Event::Applied(pod) => self.apply(&pod).into_iter().collect(),
            watcher::Event::Deleted(pod) => NamespacedName::from_resource(&pod)
                .map(|key| {
                    self.known.remove(&key);
                    (PodEventKind::Delete, key)
                })
                .into_iter()
                .collect(),
            watcher::Event::Restarted(pods) => {
                let listed: Vec<NamespacedName> =
                    pods.iter().filter_map(NamespacedName::from_resource).collect();
                let gone: Vec<NamespacedName> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                for key in &gone {
                    self.known.remove(key);
                }
                let mut edges: Vec<_> = gone
                    .into_iter()
                    .map(|key| (PodEventKind::Delete, key))
                    .collect();
                edges.extend(
                    pods.iter()
                        .filter_map(|pod| self.apply(pod))
                        .filter(|(kind, _)| *kind == PodEventKind::Create),
                );
                edges
            }
        }
    }

    fn apply(&mut self, pod: &Pod) -> Option<(PodEventKind, NamespacedName)> {
        let key = NamespacedName::from_resource(pod)?;
        let uid = pod.metadata.uid.clone();
        let kind = match self.known.insert(key.clone(), uid.clone()) {
            Some(previous) if previous == uid => PodEventKind::Update,
            _ => PodEventKind::Create,
        };
        Some((kind, key))
    }
}

/// Requests a resync whenever the broker pod `identity` is created or deleted.
pub fn broker_pod(
    api: Api<Pod>,
    identity: NamespacedName,
) -> impl Stream<Item = Result<NamespacedName, watcher::Error>> {
    let watcher_config =
        watcher::Config::default().fields(&format!("metadata.name={}", identity.name));
    let predicate = BrokerPodPredicate::new(identity);
    let mut tracker = PodTracker::default();

    watcher(api, watcher_config)
        .default_backoff()
        .map_ok(move |event| {
            let requests: Vec<Result<_, watcher::Error>> = tracker
                .classify(event)
                .into_iter()
                .filter(|(kind, pod)| predicate.accepts(*kind, pod))
                .map(|(kind, pod)| {
                    log::debug!("received watch request for broker pod {pod}: {kind:?}");
                    Ok(pod)
                })
                .collect();
            stream::iter(requests)
        })
        .try_flatten()
}
