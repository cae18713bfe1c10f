use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_core::ErrorResponse;
use kube_runtime::reflector::Store;
use parking_lot::Mutex;

use crate::api::{
    ConditionStatus, ConditionType, EventFilter, Subscription, SubscriptionConfig,
    SubscriptionSpec, FINALIZER,
};
use crate::application::Application;
use crate::backend::{self, MessagingBackend};
use crate::client::SubscriptionClient;
use crate::config::DefaultSubscriptionConfig;
use crate::eventtype::{Cleaner, EventTypeCleaner};
use crate::reconciler::{self, SubscriptionReconciler, INVALID_SUBSCRIPTION_MESSAGE};
use crate::runner::{Action, Reconcile};
use crate::subscriber::NamespacedName;

const PREFIX: &str = "sap.kyma.custom";
const SINK: &str = "http://webhook.test.svc.cluster.local";

/// In-memory API server for Subscriptions with resource-version checks.
#[derive(Clone, Default)]
struct FakeClient {
    objects: Arc<Mutex<HashMap<NamespacedName, Subscription>>>,
    status_writes: Arc<AtomicUsize>,
    conflict_next_update: Arc<AtomicBool>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube_client::Error {
    kube_client::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message,
        reason: reason.to_owned(),
        code,
    })
}

fn bump(sub: &mut Subscription) {
    let version: u64 = sub
        .metadata
        .resource_version
        .as_deref()
        .and_then(|version| version.parse().ok())
        .unwrap_or(0);
    sub.metadata.resource_version = Some((version + 1).to_string());
}

impl FakeClient {
    fn create(&self, mut sub: Subscription) -> NamespacedName {
        let key = NamespacedName::from_resource(&sub).unwrap();
        bump(&mut sub);
        self.objects.lock().insert(key.clone(), sub);
        key
    }

    fn snapshot(&self, key: &NamespacedName) -> Option<Subscription> {
        self.objects.lock().get(key).cloned()
    }

    fn edit(&self, key: &NamespacedName, f: impl FnOnce(&mut SubscriptionSpec)) {
        let mut objects = self.objects.lock();
        let sub = objects.get_mut(key).unwrap();
        f(&mut sub.spec);
        bump(sub);
    }

    /// Marks the object as terminating, or removes it if no finalizer blocks deletion.
    fn delete(&self, key: &NamespacedName) {
        let mut objects = self.objects.lock();
        let sub = objects.get_mut(key).unwrap();
        if sub.metadata.finalizers.iter().flatten().next().is_some() {
            sub.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            bump(sub);
        } else {
            objects.remove(key);
        }
    }

    fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn check_version(
        &self,
        stored: &Subscription,
        sub: &Subscription,
    ) -> Result<(), kube_client::Error> {
        if self.conflict_next_update.swap(false, Ordering::SeqCst)
            || stored.metadata.resource_version != sub.metadata.resource_version
        {
            return Err(api_error(
                409,
                "Conflict",
                "the object has been modified; please apply your changes to the latest version".to_owned(),
            ));
        }
        Ok(())
    }
}

impl SubscriptionClient for FakeClient {
    async fn get(&self, key: &NamespacedName) -> Result<Option<Subscription>, kube_client::Error> {
        Ok(self.snapshot(key))
    }

    async fn update(&self, sub: &Subscription) -> Result<Subscription, kube_client::Error> {
        let key = NamespacedName::from_resource(sub).unwrap();
        let mut objects = self.objects.lock();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        self.check_version(stored, sub)?;

        stored.metadata = sub.metadata.clone();
        stored.spec = sub.spec.clone();
        bump(stored);
        let updated = stored.clone();
        if updated.is_being_deleted() && updated.metadata.finalizers.iter().flatten().next().is_none() {
            objects.remove(&key);
        }
        Ok(updated)
    }

    async fn update_status(&self, sub: &Subscription) -> Result<Subscription, kube_client::Error> {
        let key = NamespacedName::from_resource(sub).unwrap();
        let mut objects = self.objects.lock();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        self.check_version(stored, sub)?;

        stored.status = sub.status.clone();
        bump(stored);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

/// Backend keeping registrations as subject lists.
#[derive(Default)]
struct FakeBackend {
    defaults: DefaultSubscriptionConfig,
    registrations: Mutex<HashMap<NamespacedName, Vec<String>>>,
    invalid: Mutex<BTreeSet<NamespacedName>>,
    unavailable: AtomicBool,
    refuse_subscribe: AtomicBool,
    deletes: AtomicUsize,
}

impl FakeBackend {
    fn subjects(&self, key: &NamespacedName) -> Option<Vec<String>> {
        self.registrations.lock().get(key).cloned()
    }

    /// Loses every registration, as a broker restart does.
    fn restart(&self) {
        let lost: Vec<_> = self.registrations.lock().drain().map(|(key, _)| key).collect();
        self.invalid.lock().extend(lost);
    }

    fn connectivity_error() -> backend::Error {
        backend::Error::Connect("nats: no servers available for connection".into())
    }
}

impl MessagingBackend for FakeBackend {
    async fn initialize(&self) -> Result<(), backend::Error> {
        Ok(())
    }

    async fn sync_subscription<C: Cleaner + Sync>(
        &self,
        sub: &mut Subscription,
        cleaner: &C,
    ) -> Result<bool, backend::Error> {
        let subjects = backend::clean_subjects(sub, cleaner)?;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Self::connectivity_error());
        }
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(backend::Error::Subscribe {
                subject: subjects.first().cloned().unwrap_or_default(),
                source: "nats: maximum subscriptions exceeded".into(),
            });
        }

        let key = NamespacedName::from_resource(&*sub).ok_or(backend::Error::MissingName)?;
        let config = SubscriptionConfig::merge(sub.spec.config.as_ref(), &self.defaults);
        self.registrations.lock().insert(key.clone(), subjects.clone());
        self.invalid.lock().remove(&key);

        let status = sub.status.get_or_insert_with(Default::default);
        status.clean_event_types = subjects;
        status.config = Some(config);
        Ok(true)
    }

    async fn delete_subscription(&self, sub: &Subscription) -> Result<(), backend::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Self::connectivity_error());
        }
        let key = NamespacedName::from_resource(sub).ok_or(backend::Error::MissingName)?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.registrations.lock().remove(&key);
        Ok(())
    }

    async fn invalid_subscriptions(&self) -> Vec<NamespacedName> {
        self.invalid.lock().iter().cloned().collect()
    }
}

type TestReconciler = SubscriptionReconciler<FakeClient, FakeBackend, EventTypeCleaner<Store<Application>>>;

struct Harness {
    client: FakeClient,
    reconciler: TestReconciler,
}

fn broker_pod() -> NamespacedName {
    NamespacedName::new("kyma-system", "eventing-nats-1")
}

fn harness() -> Harness {
    let client = FakeClient::default();
    let reconciler = SubscriptionReconciler::new(
        client.clone(),
        FakeBackend::default(),
        EventTypeCleaner::new(PREFIX, None),
        broker_pod(),
    );
    Harness { client, reconciler }
}

fn subscription(name: &str, sink: &str, event_types: &[&str]) -> Subscription {
    let mut sub = Subscription::new(
        name,
        SubscriptionSpec {
            sink: sink.to_owned(),
            protocol: "NATS".to_owned(),
            filter: event_types
                .iter()
                .map(|event_type| EventFilter {
                    source: String::new(),
                    event_type: (*event_type).to_owned(),
                })
                .collect(),
            config: None,
        },
    );
    sub.metadata.namespace = Some("test".to_owned());
    sub
}

impl Harness {
    fn backend(&self) -> &FakeBackend {
        self.reconciler.backend()
    }

    async fn reconcile(&self, key: &NamespacedName) -> Result<Action, reconciler::Error> {
        self.reconciler.reconcile(key).await
    }

    /// Reconciles until no immediate requeue is requested.
    async fn converge(&self, key: &NamespacedName) -> Result<Action, reconciler::Error> {
        for _ in 0..5 {
            match self.reconcile(key).await? {
                Action::Requeue => continue,
                action => return Ok(action),
            }
        }
        panic!("{key} did not settle");
    }

    fn active_condition(&self, key: &NamespacedName) -> (ConditionStatus, String) {
        let sub = self.client.snapshot(key).unwrap();
        let status = sub.status.unwrap();
        let condition = status
            .find_condition(ConditionType::SubscriptionActive)
            .unwrap();
        (condition.status, condition.message.clone())
    }
}

#[tokio::test]
async fn valid_subscription_becomes_active() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));

    // the first pass only persists the finalizer
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::Requeue);
    let sub = h.client.snapshot(&key).unwrap();
    assert_eq!(sub.metadata.finalizers, Some(vec![FINALIZER.to_owned()]));
    assert_eq!(h.backend().subjects(&key), None);

    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.active_condition(&key).0, ConditionStatus::True);

    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert!(status.ready);
    assert_eq!(
        status.clean_event_types,
        vec!["sap.kyma.custom.commerce.order.created.v1".to_owned()]
    );
    assert_eq!(
        h.backend().subjects(&key),
        Some(vec!["sap.kyma.custom.commerce.order.created.v1".to_owned()])
    );
}

#[tokio::test]
async fn reconciling_unchanged_subscription_writes_nothing() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();

    let before = h.client.snapshot(&key).unwrap();
    let writes = h.client.status_writes();

    h.reconcile(&key).await.unwrap();
    h.reconcile(&key).await.unwrap();

    assert_eq!(h.client.status_writes(), writes);
    assert_eq!(h.client.snapshot(&key).unwrap(), before);
}

#[tokio::test]
async fn conditions_of_other_controllers_are_kept() {
    let h = harness();
    let mut sub = subscription("sub", SINK, &["sap.kyma.custom.commerce.order.created.v1"]);
    sub.status = Some(
        serde_json::from_value(serde_json::json!({
            "ready": false,
            "conditions": [
                {"type": "Subscribed", "status": "True", "reason": "BEB Subscription created"}
            ]
        }))
        .unwrap(),
    );
    let key = h.client.create(sub);

    h.converge(&key).await.unwrap();

    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert_eq!(
        serde_json::to_value(&status.conditions).unwrap(),
        serde_json::json!([
            {"type": "Subscribed", "status": "True", "reason": "BEB Subscription created"},
            {"type": "Subscription active", "status": "True", "reason": "NATS Subscription active"}
        ])
    );
}

#[tokio::test]
async fn invalid_sink_is_reported_without_retry() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        "invalid",
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));

    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);

    let (status, message) = h.active_condition(&key);
    assert_eq!(status, ConditionStatus::False);
    assert!(message.contains("invalid URI"), "{message}");
    assert!(!h.client.snapshot(&key).unwrap().status.unwrap().ready);
    assert_eq!(h.backend().subjects(&key), None);
}

#[tokio::test]
async fn empty_event_type_is_a_bad_subject() {
    let h = harness();
    let key = h.client.create(subscription("sub", SINK, &[""]));

    assert_eq!(h.converge(&key).await.unwrap(), Action::AwaitChange);

    let (status, message) = h.active_condition(&key);
    assert_eq!(status, ConditionStatus::False);
    assert!(message.contains("invalid subject"), "{message}");
    assert_eq!(h.backend().subjects(&key), None);
}

#[tokio::test]
async fn broker_outage_is_retried_until_recovery() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::Requeue);

    h.backend().unavailable.store(true, Ordering::SeqCst);
    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, reconciler::Error::Delete(_)), "{err}");
    let (status, message) = h.active_condition(&key);
    assert_eq!(status, ConditionStatus::False);
    assert!(message.contains("no servers available"), "{message}");

    h.backend().unavailable.store(false, Ordering::SeqCst);
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.active_condition(&key).0, ConditionStatus::True);
}

#[tokio::test]
async fn failed_subscribe_is_retried() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::Requeue);

    h.backend().refuse_subscribe.store(true, Ordering::SeqCst);
    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, reconciler::Error::Sync(_)), "{err}");
    let (status, message) = h.active_condition(&key);
    assert_eq!(status, ConditionStatus::False);
    assert!(message.contains("maximum subscriptions exceeded"), "{message}");

    h.backend().refuse_subscribe.store(false, Ordering::SeqCst);
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.active_condition(&key).0, ConditionStatus::True);
}

#[tokio::test]
async fn deleted_subscription_is_released_after_cleanup() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();

    h.client.delete(&key);
    let terminating = h.client.snapshot(&key).unwrap();
    assert!(terminating.is_being_deleted());
    assert!(terminating.has_finalizer());

    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
    assert!(h.client.snapshot(&key).is_none());
    assert_eq!(h.backend().subjects(&key), None);

    // a late request for the removed object is a no-op
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
}

#[tokio::test]
async fn deletion_without_our_finalizer_is_ignored() {
    let h = harness();
    let mut sub = subscription("sub", SINK, &["sap.kyma.custom.commerce.order.created.v1"]);
    sub.metadata.finalizers = Some(vec!["other.io/protect".to_owned()]);
    let key = h.client.create(sub);
    h.client.delete(&key);

    assert_eq!(h.reconcile(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.backend().deletes.load(Ordering::SeqCst), 0);
    let sub = h.client.snapshot(&key).unwrap();
    assert_eq!(sub.metadata.finalizers, Some(vec!["other.io/protect".to_owned()]));
}

#[tokio::test]
async fn backend_failure_keeps_the_finalizer() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();
    h.client.delete(&key);

    h.backend().unavailable.store(true, Ordering::SeqCst);
    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, reconciler::Error::Delete(_)));
    assert!(h.client.snapshot(&key).unwrap().has_finalizer());

    h.backend().unavailable.store(false, Ordering::SeqCst);
    h.reconcile(&key).await.unwrap();
    assert!(h.client.snapshot(&key).is_none());
}

#[tokio::test]
async fn config_changes_are_applied() {
    let h = harness();
    let mut sub = subscription("sub", SINK, &["sap.kyma.custom.commerce.order.created.v1"]);
    sub.spec.config = Some(SubscriptionConfig {
        max_in_flight_messages: 3,
    });
    let key = h.client.create(sub);
    h.converge(&key).await.unwrap();
    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert_eq!(status.config.unwrap().max_in_flight_messages, 3);

    h.client.edit(&key, |spec| {
        spec.config = Some(SubscriptionConfig {
            max_in_flight_messages: 4,
        })
    });
    h.reconcile(&key).await.unwrap();

    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert_eq!(status.config.unwrap().max_in_flight_messages, 4);
    assert_eq!(h.active_condition(&key).0, ConditionStatus::True);
}

#[tokio::test]
async fn default_config_is_recorded() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();

    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert_eq!(
        status.config,
        Some(SubscriptionConfig {
            max_in_flight_messages: DefaultSubscriptionConfig::default().max_in_flight_messages,
        })
    );
}

#[tokio::test]
async fn filter_changes_replace_subjects() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();

    h.client.edit(&key, |spec| {
        spec.filter[0].event_type = "sap.kyma.custom.commerce.order-item.deleted.v2".to_owned();
    });
    h.reconcile(&key).await.unwrap();

    let expected = vec!["sap.kyma.custom.commerce.orderitem.deleted.v2".to_owned()];
    assert_eq!(h.backend().subjects(&key), Some(expected.clone()));
    let status = h.client.snapshot(&key).unwrap().status.unwrap();
    assert_eq!(status.clean_event_types, expected);
}

#[tokio::test]
async fn broker_restart_invalidates_and_recovers() {
    let h = harness();
    let keys = [
        h.client.create(subscription("first", SINK, &["sap.kyma.custom.commerce.order.created.v1"])),
        h.client.create(subscription("second", SINK, &["sap.kyma.custom.commerce.order.updated.v1"])),
    ];
    for key in &keys {
        h.converge(key).await.unwrap();
    }

    h.backend().restart();
    assert_eq!(h.reconcile(&broker_pod()).await.unwrap(), Action::AwaitChange);

    for key in &keys {
        let (status, message) = h.active_condition(key);
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(message, INVALID_SUBSCRIPTION_MESSAGE);
        assert!(!h.client.snapshot(key).unwrap().status.unwrap().ready);
    }

    // the status writes trigger regular reconciles
    for key in &keys {
        h.reconcile(key).await.unwrap();
        assert_eq!(h.active_condition(key).0, ConditionStatus::True);
    }
    assert!(h.backend().invalid_subscriptions().await.is_empty());
}

#[tokio::test]
async fn vanished_invalid_subscriptions_are_skipped() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));
    h.converge(&key).await.unwrap();

    h.backend().restart();
    h.backend()
        .invalid
        .lock()
        .insert(NamespacedName::new("test", "gone"));

    h.reconcile(&broker_pod()).await.unwrap();
    assert_eq!(h.active_condition(&key).0, ConditionStatus::False);
}

#[tokio::test]
async fn finalizer_is_never_duplicated() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));

    for _ in 0..5 {
        h.reconcile(&key).await.unwrap();
    }
    assert_eq!(h.client.snapshot(&key).unwrap().finalizer_count(), 1);
}

#[tokio::test]
async fn conflicting_finalizer_update_is_retried() {
    let h = harness();
    let key = h.client.create(subscription(
        "sub",
        SINK,
        &["sap.kyma.custom.commerce.order.created.v1"],
    ));

    h.client.conflict_next_update.store(true, Ordering::SeqCst);
    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, reconciler::Error::AddFinalizer(_)), "{err}");
    assert!(!h.client.snapshot(&key).unwrap().has_finalizer());

    assert_eq!(h.converge(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.client.snapshot(&key).unwrap().finalizer_count(), 1);
    assert_eq!(h.active_condition(&key).0, ConditionStatus::True);
}

#[tokio::test]
async fn missing_subscription_is_not_an_error() {
    let h = harness();
    let action = h
        .reconcile(&NamespacedName::new("test", "missing"))
        .await
        .unwrap();
    assert_eq!(action, Action::AwaitChange);
    assert_eq!(h.client.status_writes(), 0);
}
