//! Caller-stamped request provenance, passed through to guards and
//! handlers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Whether a request was triggered directly by a user action or by
/// internal/system logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaSource {
    User,
    System,
}

/// A stamped record carrying caller provenance for one request. Generic
/// over an opaque `Ctx` payload so callers can attach structured context
/// without this crate needing to know its shape.
///
/// Rust's type system already makes a concrete struct unambiguously
/// identifiable, so no synthetic brand field is carried here.
#[derive(Clone, Debug)]
pub struct RequestMeta<Ctx = ()> {
    pub source: Option<MetaSource>,
    pub timestamp: u64,
    pub reason: Option<Arc<str>>,
    pub context: Option<Ctx>,
}

impl<Ctx> Default for RequestMeta<Ctx> {
    fn default() -> Self {
        Self {
            source: None,
            timestamp: now_millis(),
            reason: None,
            context: None,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builder-style constructor for a [`RequestMeta`]. Any field left unset
/// falls back to the corresponding [`RequestMeta::default`].
#[derive(Default)]
pub struct MetaBuilder<Ctx = ()> {
    source: Option<MetaSource>,
    timestamp: Option<u64>,
    reason: Option<Arc<str>>,
    context: Option<Ctx>,
}

impl<Ctx> MetaBuilder<Ctx> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: None,
            timestamp: None,
            reason: None,
            context: None,
        }
    }

    #[must_use]
    pub fn source(mut self, source: MetaSource) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn context(mut self, context: Ctx) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn build(self) -> RequestMeta<Ctx> {
        RequestMeta {
            source: self.source,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            reason: self.reason,
            context: self.context,
        }
    }
}

/// Stands in for a platform event carrying `isTrusted`/`timeStamp`/`type`-
/// shaped provenance. A platform adapter implements this for whatever
/// event type its target actually emits.
pub trait EventLike {
    fn is_trusted(&self) -> bool;
    fn timestamp_millis(&self) -> u64;
    fn event_type(&self) -> &str;
}

/// Builds a [`RequestMeta`] from an [`EventLike`] value: `is_trusted` maps
/// to [`MetaSource::User`] (true) or [`MetaSource::System`] (false), and
/// the event's type becomes the `reason`.
pub fn metadata_from_event<Ctx>(event: &impl EventLike, context: Option<Ctx>) -> RequestMeta<Ctx> {
    RequestMeta {
        source: Some(if event.is_trusted() {
            MetaSource::User
        } else {
            MetaSource::System
        }),
        timestamp: event.timestamp_millis(),
        reason: Some(Arc::from(event.event_type())),
        context,
    }
}
