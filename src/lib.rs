//! nats-subscription-controller keeps live NATS subscriptions in sync with
//! `Subscription` custom resources.
//!
//! A Subscription declares a sink URL and a list of event type filters.
//! For every filter, the controller registers a NATS queue group whose members
//! forward matching CloudEvents to the sink.
//! Two watches feed one work queue: the Subscriptions themselves,
//! and the NATS server pod, whose restarts trigger a resync of every
//! Subscription the backend reports as no longer live.

pub mod api;
pub mod application;
pub mod backend;
pub mod client;
pub mod config;
pub use config::Config;
mod controller;
pub use controller::run;
pub mod eventtype;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub use runner::RunError;
pub mod subscriber;

#[cfg(test)]
mod tests;
