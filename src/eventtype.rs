//! Canonicalization of application-scoped event types into NATS subjects.
//!
//! An event type has the form `[<prefix>.]<application>.<segment>...<segment>.<version>`
//! with at least two event segments. Cleaning resolves the application segment to the
//! Application's type label (or name), strips every segment of non-alphanumeric characters,
//! and joins all event segments but the last one into a single segment.

use crate::application::ApplicationLister;

/// Maps a raw event type to its canonical NATS subject.
pub trait Cleaner {
    fn clean(&self, event_type: &str) -> Result<String, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("event type {event_type:?} does not start with prefix {prefix:?}")]
    PrefixMismatch { event_type: String, prefix: String },
    #[error("event type {0:?} must have an application, at least two event segments and a version")]
    Incomplete(String),
    #[error("event type {0:?} has an empty application name")]
    EmptyApplication(String),
}

/// Cleans event types using Application metadata from an optional lister.
///
/// Without a lister, the application segment of the event type is used as is.
pub struct EventTypeCleaner<L> {
    prefix: String,
    applications: Option<L>,
}

impl<L: ApplicationLister> EventTypeCleaner<L> {
    pub fn new(prefix: impl Into<String>, applications: Option<L>) -> Self {
        Self {
            prefix: prefix.into(),
            applications,
        }
    }

    fn application_segment(&self, raw: &str) -> String {
        let app = self
            .applications
            .as_ref()
            .and_then(|lister| lister.application(raw));
        match app {
            Some(app) => alphanumeric(app.type_or_name()),
            None => alphanumeric(raw),
        }
    }
}

impl<L: ApplicationLister> Cleaner for EventTypeCleaner<L> {
    fn clean(&self, event_type: &str) -> Result<String, Error> {
        let unprefixed = if self.prefix.is_empty() {
            event_type
        } else {
            event_type
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .ok_or_else(|| Error::PrefixMismatch {
                    event_type: event_type.to_owned(),
                    prefix: self.prefix.clone(),
                })?
        };

        let segments: Vec<&str> = unprefixed.split('.').collect();
        let [app, event @ .., version] = segments.as_slice() else {
            return Err(Error::Incomplete(event_type.to_owned()));
        };
        let [combined @ .., last] = event else {
            return Err(Error::Incomplete(event_type.to_owned()));
        };
        if combined.is_empty() {
            return Err(Error::Incomplete(event_type.to_owned()));
        }

        let app = self.application_segment(app);
        if app.is_empty() {
            return Err(Error::EmptyApplication(event_type.to_owned()));
        }
        let combined: String = combined.iter().map(|segment| alphanumeric(segment)).collect();

        let mut parts = Vec::with_capacity(5);
        if !self.prefix.is_empty() {
            parts.push(self.prefix.clone());
        }
        parts.extend([app, combined, alphanumeric(last), (*version).to_owned()]);
        Ok(parts.join("."))
    }
}

fn alphanumeric(segment: &str) -> String {
    segment.chars().filter(char::is_ascii_alphanumeric).collect()
}
