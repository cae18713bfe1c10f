//! Lookup of the `Application` resources event types are scoped to.

use std::sync::Arc;

use futures::{future, Future, StreamExt};
use kube_client::Api;
use kube_derive::CustomResource;
use kube_runtime::{reflector, reflector::ObjectRef, watcher, WatchStreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the application type, preferred over the name when present.
pub const TYPE_LABEL: &str = "application-type";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "applicationconnector.kyma-project.io",
    version = "v1alpha1",
    kind = "Application",
    crates(kube_core = "::kube_core")
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Application {
    /// The application type label if set, otherwise the application name.
    pub fn type_or_name(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(TYPE_LABEL))
            .map(String::as_str)
            .filter(|label| !label.is_empty())
            .or(self.metadata.name.as_deref())
            .unwrap_or_default()
    }
}

/// Read access to the cluster's Applications by name.
pub trait ApplicationLister {
    fn application(&self, name: &str) -> Option<Arc<Application>>;
}

impl ApplicationLister for reflector::Store<Application> {
    fn application(&self, name: &str) -> Option<Arc<Application>> {
        self.get(&ObjectRef::new(name))
    }
}

/// Creates a cached lister for Applications.
///
/// The returned future keeps the cache up to date and must be polled for the lifetime of the lister.
pub fn lister(
    api: Api<Application>,
) -> (reflector::Store<Application>, impl Future<Output = ()> + Send) {
    let writer = reflector::store::Writer::default();
    let store = writer.as_reader();

    let driver = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .for_each(|result| {
            if let Err(err) = result {
                log::warn!("watch applications failed: {err}");
            }
            future::ready(())
        });

    (store, driver)
}
