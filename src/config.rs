//! Construction-time settings for [`run`](crate::run).
//!
//! All values are fixed for the lifetime of the controller.

use std::time::Duration;

use crate::subscriber::NamespacedName;

/// Name of the first NATS server pod; its restarts trigger a resync.
pub const NATS_FIRST_INSTANCE_NAME: &str = "eventing-nats-1";
/// Namespace of the NATS cluster.
pub const NATS_NAMESPACE: &str = "kyma-system";

/// Parameters for [`run`](crate::run).
#[derive(Debug, Clone)]
pub struct Config {
    pub nats: NatsConfig,
    pub subscription_defaults: DefaultSubscriptionConfig,
    pub runner: RunnerConfig,
    /// The broker pod whose create/delete events invalidate live registrations.
    pub broker_pod: NamespacedName,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            subscription_defaults: DefaultSubscriptionConfig::default(),
            runner: RunnerConfig::default(),
            broker_pod: NamespacedName::new(NATS_NAMESPACE, NATS_FIRST_INSTANCE_NAME),
        }
    }
}

impl Config {
    pub fn with_nats(mut self, nats: NatsConfig) -> Self {
        self.nats = nats;
        self
    }

    pub fn with_subscription_defaults(mut self, defaults: DefaultSubscriptionConfig) -> Self {
        self.subscription_defaults = defaults;
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_broker_pod(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.broker_pod = NamespacedName::new(namespace, name);
        self
    }
}

/// Connection to the NATS server and HTTP delivery to sinks.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub max_reconnects: usize,
    pub reconnect_wait: Duration,
    /// Prefix every cleaned event type must carry; empty for none.
    pub event_type_prefix: String,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://eventing-nats.kyma-system.svc.cluster.local:4222".to_owned(),
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(3),
            event_type_prefix: String::new(),
            max_idle_conns_per_host: 50,
            idle_conn_timeout: Duration::from_secs(10),
        }
    }
}

impl NatsConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_max_reconnects(mut self, max_reconnects: usize) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn with_reconnect_wait(mut self, reconnect_wait: Duration) -> Self {
        self.reconnect_wait = reconnect_wait;
        self
    }

    pub fn with_event_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_type_prefix = prefix.into();
        self
    }

    /// Idle connection pooling of the HTTP client delivering to sinks.
    pub fn with_http_pool(mut self, max_idle_conns_per_host: usize, idle_conn_timeout: Duration) -> Self {
        self.max_idle_conns_per_host = max_idle_conns_per_host;
        self.idle_conn_timeout = idle_conn_timeout;
        self
    }
}

/// Delivery defaults applied when a Subscription does not override them.
#[derive(Debug, Clone)]
pub struct DefaultSubscriptionConfig {
    pub max_in_flight_messages: i32,
    pub dispatcher_max_retries: u32,
    pub dispatcher_retry_period: Duration,
}

impl Default for DefaultSubscriptionConfig {
    fn default() -> Self {
        Self {
            max_in_flight_messages: 10,
            dispatcher_max_retries: 10,
            dispatcher_retry_period: Duration::from_secs(5),
        }
    }
}

impl DefaultSubscriptionConfig {
    pub fn with_max_in_flight_messages(mut self, max: i32) -> Self {
        self.max_in_flight_messages = max;
        self
    }

    pub fn with_dispatcher_retries(mut self, max_retries: u32, period: Duration) -> Self {
        self.dispatcher_max_retries = max_retries;
        self.dispatcher_retry_period = period;
        self
    }
}

/// Work queue and worker pool settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of reconciles that may run concurrently (for distinct keys).
    pub workers: usize,
    /// First retry delay of a failing key; doubled on each consecutive failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single reconcile; `None` leaves it to the clients' own timeouts.
    pub reconcile_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
            reconcile_timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = Some(timeout);
        self
    }
}
