//! NATS core backend: one queue group per Subscription and subject, with
//! `maxInFlightMessages` members each delivering one event at a time.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_nats::{connection::State, Event, Message};
use futures::{future, stream, Stream};
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use super::registry::{Delivery, Registry};
use super::{clean_subjects, dispatch::Dispatcher, Error, MessagingBackend};
use crate::api::{Subscription, SubscriptionConfig};
use crate::config::{DefaultSubscriptionConfig, NatsConfig};
use crate::eventtype::Cleaner;
use crate::subscriber::NamespacedName;

pub struct NatsBackend {
    config: NatsConfig,
    defaults: DefaultSubscriptionConfig,
    delivery: Arc<SinkDelivery>,
    connection: Mutex<Option<async_nats::Client>>,
    registry: Mutex<Registry>,
    reconnects: Arc<ReconnectSignal>,
}

impl NatsBackend {
    pub fn new(config: NatsConfig, defaults: DefaultSubscriptionConfig) -> Result<Self, Error> {
        let dispatcher = Dispatcher::new(&config, &defaults)?;
        Ok(Self {
            config,
            defaults,
            delivery: Arc::new(SinkDelivery {
                sinks: RwLock::default(),
                dispatcher,
            }),
            connection: Mutex::new(None),
            registry: Mutex::default(),
            reconnects: Arc::new(ReconnectSignal::new()),
        })
    }

    /// Yields once each time the client re-establishes a lost connection.
    ///
    /// The server may have dropped every subscription in the meantime, so each
    /// signal should be answered with a reconcile of all Subscriptions.
    pub fn reconnects(&self) -> impl Stream<Item = ()> + Send + 'static {
        stream::unfold(self.reconnects.resyncs.subscribe(), |mut receiver| async move {
            receiver.changed().await.ok()?;
            Some(((), receiver))
        })
    }

    /// Returns the client, connecting on first use.
    ///
    /// A disconnected client is kept: it reconnects on its own and replays its
    /// subscriptions, and requests issued meanwhile are buffered.
    async fn connection(&self) -> Result<async_nats::Client, Error> {
        let mut connection = self.connection.lock().await;
        if let Some(client) = connection.as_ref() {
            let state = client.connection_state();
            if state != State::Connected {
                log::debug!("NATS connection is {state}, waiting for the client to reconnect");
            }
            return Ok(client.clone());
        }

        let reconnect_wait = self.config.reconnect_wait;
        let reconnects = Arc::clone(&self.reconnects);
        let client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(self.config.max_reconnects))
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(move |event| {
                reconnects.observe(&event);
                future::ready(())
            })
            .connect(self.config.url.as_str())
            .await
            .map_err(|err| Error::Connect(Box::new(err)))?;
        *connection = Some(client.clone());
        Ok(client)
    }
}

impl MessagingBackend for NatsBackend {
    async fn initialize(&self) -> Result<(), Error> {
        self.connection().await.map(drop)
    }

    async fn sync_subscription<C: Cleaner + Sync>(
        &self,
        sub: &mut Subscription,
        cleaner: &C,
    ) -> Result<bool, Error> {
        let owner = NamespacedName::from_resource(&*sub).ok_or(Error::MissingName)?;
        let config = SubscriptionConfig::merge(sub.spec.config.as_ref(), &self.defaults);
        let subjects = clean_subjects(sub, cleaner)?;
        let previous = sub.status_or_default();

        // The reconciler deletes before every sync, which leaves nothing for the
        // subject and member-count cleanups below; they serve callers that sync
        // an existing registration directly.
        if previous.clean_event_types != subjects {
            log::info!(
                "deleting NATS subscriptions of {owner} because filters changed: {:?} -> {subjects:?}",
                previous.clean_event_types
            );
            self.delete_subscription(sub).await?;
        }

        self.delivery
            .sinks
            .write()
            .insert(owner.clone(), sub.spec.sink.clone());

        let client = self.connection().await?;
        let max = member_count(config.max_in_flight_messages);
        let previous_max = previous
            .config
            .map(|config| member_count(config.max_in_flight_messages));

        let mut registry = self.registry.lock().await;
        let mut created = false;
        for subject in &subjects {
            created |= registry
                .ensure_members(&owner, subject, previous_max, max, &self.delivery, |subject, group| {
                    let client = client.clone();
                    async move {
                        client
                            .queue_subscribe(subject.clone(), group)
                            .await
                            .map_err(|err| Error::Subscribe {
                                subject,
                                source: Box::new(err),
                            })
                    }
                })
                .await?;
        }
        drop(registry);

        let status = sub.status.get_or_insert_with(Default::default);
        status.clean_event_types = subjects;
        status.config = Some(config);
        Ok(created)
    }

    async fn delete_subscription(&self, sub: &Subscription) -> Result<(), Error> {
        let owner = NamespacedName::from_resource(sub).ok_or(Error::MissingName)?;
        self.registry.lock().await.remove_owner(&owner).await?;
        self.delivery.sinks.write().remove(&owner);
        Ok(())
    }

    async fn invalid_subscriptions(&self) -> Vec<NamespacedName> {
        self.registry.lock().await.invalid()
    }
}

/// Posts received events to the current sink of their Subscription.
struct SinkDelivery {
    sinks: RwLock<HashMap<NamespacedName, String>>,
    dispatcher: Dispatcher,
}

impl Delivery for SinkDelivery {
    async fn deliver(&self, owner: &NamespacedName, message: Message) {
        let sink = self.sinks.read().get(owner).cloned();
        let Some(sink) = sink else {
            log::error!("cannot find sink of {owner}");
            return;
        };
        if let Err(err) = self.dispatcher.dispatch(&sink, &message.payload).await {
            log::error!("event dispatch to {sink} failed after retries: {err}");
        }
    }
}

/// Turns connection events into resync signals.
struct ReconnectSignal {
    disconnected: AtomicBool,
    resyncs: watch::Sender<u64>,
}

impl ReconnectSignal {
    fn new() -> Self {
        Self {
            disconnected: AtomicBool::new(false),
            resyncs: watch::channel(0).0,
        }
    }

    fn observe(&self, event: &Event) {
        match event {
            Event::Disconnected => {
                log::warn!("NATS connection lost");
                self.disconnected.store(true, Ordering::SeqCst);
            }
            Event::Connected => {
                if self.disconnected.swap(false, Ordering::SeqCst) {
                    log::info!("NATS connection re-established, resyncing all subscriptions");
                    self.resyncs.send_modify(|count| *count += 1);
                }
            }
            event => log::debug!("NATS connection event: {event}"),
        }
    }
}

fn member_count(max_in_flight_messages: i32) -> usize {
    usize::try_from(max_in_flight_messages).unwrap_or(0).max(1)
}
