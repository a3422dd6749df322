//! Event mapping: synthesize an aggregate event once a set of constituent
//! events has all been observed on a channel.
//!
//! Matching follows the same shape as `routing::rules::RoutingRule::matches`
//! (checking a set of filters against an incoming message) but narrowed
//! to this system's exact contract: a matcher fires when the event name
//! is equal and the event's payload is a superset of the matcher's
//! `payload_subset`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde_json::Map as JsonMap;
use thiserror::Error;

use crate::event::Event;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventMapError {
    #[error("event mapping requires at least two distinct events")]
    InvalidMappingEvents,
    #[error("an event mapping with key {0} already exists")]
    DuplicateMapping(String),
    #[error("remote map_events call failed: {0}")]
    Rpc(String),
    #[error("broker rejected map_events: {0}")]
    Remote(String),
}

/// One constituent event a mapping waits to observe.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMatcher {
    pub name: String,
    pub payload_subset: JsonMap<String, serde_json::Value>,
}

impl EventMatcher {
    pub fn new(name: impl Into<String>, payload_subset: JsonMap<String, serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            payload_subset,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.name != event.name {
            return false;
        }
        self.payload_subset
            .iter()
            .all(|(key, value)| event.payload.get(key) == Some(value))
    }
}

impl From<Event> for EventMatcher {
    fn from(event: Event) -> Self {
        Self {
            name: event.name,
            payload_subset: event.payload,
        }
    }
}

/// Deterministic key for a mapping, derived from the sorted constituent
/// event names plus the target event name, so re-installing the same
/// logical mapping always yields the same key.
pub fn derive_key(events_to_map: &[EventMatcher], target_name: &str) -> String {
    let mut names: Vec<&str> = events_to_map.iter().map(|m| m.name.as_str()).collect();
    names.sort_unstable();

    let mut hasher = DefaultHasher::new();
    for name in &names {
        name.hash(&mut hasher);
    }
    target_name.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub struct EventMap {
    pub key: String,
    pub events_to_map: Vec<EventMatcher>,
    pub event_to_post: Event,
    observed: HashSet<usize>,
}

impl EventMap {
    pub fn new(key: String, events_to_map: Vec<EventMatcher>, event_to_post: Event) -> Self {
        Self {
            key,
            events_to_map,
            event_to_post,
            observed: HashSet::new(),
        }
    }

    /// Record that `event` matched one of this mapping's unobserved
    /// matchers, if any. Returns true once every matcher has been observed.
    pub fn observe(&mut self, event: &Event) -> bool {
        for (index, matcher) in self.events_to_map.iter().enumerate() {
            if self.observed.contains(&index) {
                continue;
            }
            if matcher.matches(event) {
                self.observed.insert(index);
                break;
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.observed.len() == self.events_to_map.len()
    }
}

/// Validate the constituent event set: at least two events, no duplicate
/// names (`InvalidMappingEvents`).
pub fn validate_events_to_map(events_to_map: &[EventMatcher]) -> Result<(), EventMapError> {
    if events_to_map.len() < 2 {
        return Err(EventMapError::InvalidMappingEvents);
    }

    let mut names: Vec<&str> = events_to_map.iter().map(|m| m.name.as_str()).collect();
    names.sort_unstable();
    let before = names.len();
    names.dedup();
    if names.len() != before {
        return Err(EventMapError::InvalidMappingEvents);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher(name: &str) -> EventMatcher {
        EventMatcher::new(name, JsonMap::new())
    }

    #[test]
    fn derive_key_is_order_independent() {
        let a = vec![matcher("a"), matcher("b")];
        let b = vec![matcher("b"), matcher("a")];
        assert_eq!(derive_key(&a, "done"), derive_key(&b, "done"));
    }

    #[test]
    fn derive_key_differs_by_target() {
        let events = vec![matcher("a"), matcher("b")];
        assert_ne!(derive_key(&events, "done"), derive_key(&events, "finished"));
    }

    #[test]
    fn validate_rejects_single_event() {
        let events = vec![matcher("a")];
        assert_eq!(
            validate_events_to_map(&events),
            Err(EventMapError::InvalidMappingEvents)
        );
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let events = vec![matcher("a"), matcher("a")];
        assert_eq!(
            validate_events_to_map(&events),
            Err(EventMapError::InvalidMappingEvents)
        );
    }

    #[test]
    fn event_map_fires_once_all_matchers_observed() {
        let mut payload_subset = JsonMap::new();
        payload_subset.insert("run_id".to_string(), json!(56));

        let events_to_map = vec![matcher("a"), EventMatcher::new("b", payload_subset)];
        let event_to_post = Event::new("done", JsonMap::new());
        let mut map = EventMap::new("key".to_string(), events_to_map, event_to_post);

        assert!(!map.observe(&Event::new("a", JsonMap::new())));

        let mut other_payload = JsonMap::new();
        other_payload.insert("run_id".to_string(), json!(1));
        assert!(!map.observe(&Event::new("b", other_payload)));

        let mut matching_payload = JsonMap::new();
        matching_payload.insert("run_id".to_string(), json!(56));
        assert!(map.observe(&Event::new("b", matching_payload)));
    }
}
