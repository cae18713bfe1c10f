//! Access to Subscription objects in the API server.

use std::future::Future;

use kube_client::{api::PostParams, Api, Client};

use crate::api::Subscription;
use crate::subscriber::NamespacedName;

/// The Subscription verbs the reconciler needs.
///
/// Writes carry the object's resource version; a stale version fails with a conflict.
pub trait SubscriptionClient: Send + Sync {
    /// Returns `None` if the Subscription does not exist.
    fn get(
        &self,
        key: &NamespacedName,
    ) -> impl Future<Output = Result<Option<Subscription>, kube_client::Error>> + Send;

    /// Replaces metadata and spec; the status is ignored.
    fn update(
        &self,
        sub: &Subscription,
    ) -> impl Future<Output = Result<Subscription, kube_client::Error>> + Send;

    /// Replaces the status subresource.
    fn update_status(
        &self,
        sub: &Subscription,
    ) -> impl Future<Output = Result<Subscription, kube_client::Error>> + Send;
}

/// [`SubscriptionClient`] backed by the API server.
#[derive(Clone)]
pub struct KubeSubscriptionClient {
    client: Client,
}

impl KubeSubscriptionClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Subscription> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl SubscriptionClient for KubeSubscriptionClient {
    async fn get(&self, key: &NamespacedName) -> Result<Option<Subscription>, kube_client::Error> {
        self.api(&key.namespace).get_opt(&key.name).await
    }

    async fn update(&self, sub: &Subscription) -> Result<Subscription, kube_client::Error> {
        let (namespace, name) = names(sub);
        self.api(namespace)
            .replace(name, &PostParams::default(), sub)
            .await
    }

    async fn update_status(&self, sub: &Subscription) -> Result<Subscription, kube_client::Error> {
        let (namespace, name) = names(sub);
        let data = serde_json::to_vec(sub).map_err(kube_client::Error::SerdeError)?;
        self.api(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
    }
}

fn names(sub: &Subscription) -> (&str, &str) {
    (
        sub.metadata.namespace.as_deref().unwrap_or_default(),
        sub.metadata.name.as_deref().unwrap_or_default(),
    )
}
