//! Event data model
//!
//! An `Event` is a named, timestamped, payload-carrying notification posted
//! through an `EventDispatch`. Payloads are schemaless JSON objects for wire
//! compatibility; the well-known `metadata` fields used by the broker and
//! routers get typed accessors below instead of being parsed ad hoc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const METADATA_KEY: &str = "metadata";

/// A named, timestamped, payload-carrying notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            time: Utc::now(),
            payload,
        }
    }

    pub fn metadata(&self) -> Metadata<'_> {
        Metadata(self.payload.get(METADATA_KEY))
    }

    pub fn metadata_mut(&mut self) -> MetadataMut<'_> {
        let entry = self
            .payload
            .entry(METADATA_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        MetadataMut(entry)
    }
}

/// Read-only typed view over `payload.metadata`.
pub struct Metadata<'a>(Option<&'a Value>);

impl<'a> Metadata<'a> {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.0.and_then(|v| v.get(key)).and_then(Value::as_str)
    }

    pub fn sender_url(&self) -> Option<&str> {
        self.get_str("sender_url")
    }

    pub fn original_event_id(&self) -> Option<&str> {
        self.get_str("original_event_id")
    }

    pub fn original_event_time(&self) -> Option<&str> {
        self.get_str("original_event_time")
    }

    pub fn external_event_id(&self) -> Option<&str> {
        self.get_str("external_event_id")
    }

    pub fn external_event_time(&self) -> Option<&str> {
        self.get_str("external_event_time")
    }

    pub fn channel(&self) -> Option<&str> {
        self.get_str("channel")
    }

    pub fn router(&self) -> Option<&str> {
        self.get_str("router")
    }
}

/// Mutable typed view over `payload.metadata`, used by routers to stamp
/// an event before it crosses the process boundary.
pub struct MetadataMut<'a>(&'a mut Value);

impl<'a> MetadataMut<'a> {
    fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = self.0 {
            map.insert(key.to_string(), value);
        }
    }

    pub fn set_sender_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.set("sender_url", Value::String(url.into()));
        self
    }

    pub fn set_original(
        &mut self,
        id: impl Into<String>,
        time: impl Into<String>,
        router: impl Into<String>,
    ) -> &mut Self {
        self.set("original_event_id", Value::String(id.into()));
        self.set("original_event_time", Value::String(time.into()));
        self.set("router", Value::String(router.into()));
        self
    }

    pub fn set_external(
        &mut self,
        id: impl Into<String>,
        time: impl Into<String>,
        channel: impl Into<String>,
    ) -> &mut Self {
        self.set("external_event_id", Value::String(id.into()));
        self.set("external_event_time", Value::String(time.into()));
        self.set("channel", Value::String(channel.into()));
        self
    }
}

/// Enums that expose a `namespace.value` fully-qualified event name.
pub trait NamespacedEvent {
    fn namespace(&self) -> &'static str;
    fn value(&self) -> &'static str;

    fn namespaced_value(&self) -> String {
        format!("{}.{}", self.namespace(), self.value())
    }
}

/// Events emitted by `EventDispatch` itself.
pub enum DispatchEvent {
    HandlerRegistered,
    HandlerUnregistered,
}

impl NamespacedEvent for DispatchEvent {
    fn namespace(&self) -> &'static str {
        "event_dispatch"
    }

    fn value(&self) -> &'static str {
        match self {
            Self::HandlerRegistered => "handler_registered",
            Self::HandlerUnregistered => "handler_unregistered",
        }
    }
}

/// Events emitted around registration lifecycle.
pub enum RegistrationEvent {
    CallbackFailed,
}

impl NamespacedEvent for RegistrationEvent {
    fn namespace(&self) -> &'static str {
        "registration"
    }

    fn value(&self) -> &'static str {
        "callback_failed"
    }
}

/// Events emitted around the broker process lifecycle.
pub enum EventCenterEvent {
    Started,
    Stopped,
}

impl NamespacedEvent for EventCenterEvent {
    fn namespace(&self) -> &'static str {
        "event_center"
    }

    fn value(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Diagnostic events emitted by the router, never forwarded across the wire.
pub enum RouterEvent {
    GotInternalEvent,
    GotExternalEvent,
    PropagatingInternalEvent,
}

impl NamespacedEvent for RouterEvent {
    fn namespace(&self) -> &'static str {
        "router"
    }

    fn value(&self) -> &'static str {
        match self {
            Self::GotInternalEvent => "got_internal_event",
            Self::GotExternalEvent => "got_external_event",
            Self::PropagatingInternalEvent => "propagating_internal_event",
        }
    }
}
