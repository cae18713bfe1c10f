//! Delivery of CloudEvents received from NATS to HTTP sinks.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use crate::config::{DefaultSubscriptionConfig, NatsConfig};

const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json; charset=utf-8";
const SPEC_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode CloudEvent failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("CloudEvent attribute {0:?} is missing")]
    MissingAttribute(&'static str),
    #[error("unsupported CloudEvent specversion {0:?}")]
    SpecVersion(String),
    #[error("send event failed: {0}")]
    Send(#[from] reqwest::Error),
    #[error("sink responded with {0}")]
    Status(reqwest::StatusCode),
}

/// The context attributes required of every structured-mode CloudEvent.
#[derive(Debug, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub specversion: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "type", default)]
    pub type_: String,
}

impl CloudEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let event: Self = serde_json::from_slice(payload)?;
        if event.specversion.is_empty() {
            return Err(Error::MissingAttribute("specversion"));
        }
        if event.specversion != SPEC_VERSION {
            return Err(Error::SpecVersion(event.specversion));
        }
        for (attribute, value) in [("id", &event.id), ("source", &event.source), ("type", &event.type_)] {
            if value.is_empty() {
                return Err(Error::MissingAttribute(attribute));
            }
        }
        Ok(event)
    }
}

/// Posts events to sinks, retrying failed deliveries after a constant period.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_period: Duration,
}

impl Dispatcher {
    pub fn new(nats: &NatsConfig, defaults: &DefaultSubscriptionConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(nats.max_idle_conns_per_host)
            .pool_idle_timeout(nats.idle_conn_timeout)
            .build()?;
        Ok(Self {
            client,
            max_retries: defaults.dispatcher_max_retries,
            retry_period: defaults.dispatcher_retry_period,
        })
    }

    /// Validates `payload` as a CloudEvent and delivers it unchanged to `sink`.
    pub async fn dispatch(&self, sink: &str, payload: &[u8]) -> Result<(), Error> {
        let event = CloudEvent::decode(payload)?;

        let mut retry = 0;
        loop {
            match self.send(sink, payload).await {
                Ok(()) => {
                    log::info!(
                        "event dispatched: id={} source={} type={} sink={sink}",
                        event.id,
                        event.source,
                        event.type_
                    );
                    return Ok(());
                }
                Err(err) if retry < self.max_retries => {
                    log::error!(
                        "event dispatch failed: id={} sink={sink} retry={retry}: {err}",
                        event.id
                    );
                    retry += 1;
                    tokio::time::sleep(self.retry_period).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send(&self, sink: &str, payload: &[u8]) -> Result<(), Error> {
        let response = self
            .client
            .post(sink)
            .header(CONTENT_TYPE, CLOUDEVENTS_CONTENT_TYPE)
            .body(payload.to_vec())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Status(status))
        }
    }
}
