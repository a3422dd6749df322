//! EventDispatch: the in-process handler registry and dispatcher for a
//! single channel.
//!
//! Grounded on the registration bookkeeping shape of
//! `actors::manager::SessionManagerActor` (a map mutated under a lock,
//! looked up and cloned before doing work outside the lock) generalized
//! from session actors to plain handler closures, and on
//! `routing::rules::RoutingRule` for the matcher-driven event-mapping
//! engine (see `event_map`).

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Map as JsonMap, Value};
use tracing::{debug, error};

use crate::event::{DispatchEvent, Event, NamespacedEvent};
use crate::event_map::{derive_key, validate_events_to_map, EventMap, EventMapError, EventMatcher};

/// Opaque identity used for duplicate detection and echo-prevention:
/// routers pass their own token as `skip_handler` rather than relying on
/// a string-matched repr.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(pub String);

impl HandlerId {
    pub fn generated(prefix: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{prefix}#{n}"))
    }
}

/// A registered handler: an opaque id for identity/echo-prevention plus the
/// closure invoked on matching posts.
#[derive(Clone)]
pub struct Handler {
    pub id: HandlerId,
    func: Arc<dyn Fn(&Event) + Send + Sync>,
}

impl Handler {
    pub fn new(id: HandlerId, func: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            id,
            func: Arc::new(func),
        }
    }

    fn invoke(&self, event: &Event) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.func)(event)));
        if result.is_err() {
            error!(handler = %self.id.0, event = %event.name, "handler panicked during dispatch");
        }
    }
}

/// Capability that installs event mappings. Implemented locally by
/// `EventDispatch`; implemented over RPC by the client-side router so
/// mappings are always created on the broker.
pub trait MapManager: Send + Sync {
    fn map_events(
        &self,
        events_to_map: Vec<EventMatcher>,
        event_to_post: Event,
        ignore_if_exists: bool,
    ) -> Result<String, EventMapError>;
}

#[derive(Default)]
struct Inner {
    named_handlers: HashMap<String, Vec<Handler>>,
    all_handlers: Vec<Handler>,
    maps: HashMap<String, EventMap>,
    log: Vec<Event>,
}

/// In-process registry + dispatcher for a single channel.
pub struct EventDispatch {
    channel: String,
    inner: Mutex<Inner>,
    map_manager: RwLock<Option<Arc<dyn MapManager>>>,
    logging_enabled: std::sync::atomic::AtomicBool,
}

impl EventDispatch {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            inner: Mutex::new(Inner::default()),
            map_manager: RwLock::new(None),
            logging_enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn enable_logging(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn event_log(&self) -> Vec<Event> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn set_map_manager(&self, manager: Option<Arc<dyn MapManager>>) {
        *self.map_manager.write().unwrap() = manager;
    }

    /// Register `handler` for each of `events`, or for all events when
    /// `events` is empty. Duplicate (handler, event) pairs are no-ops.
    /// Posts `handler_registered` once, carrying the full requested event
    /// list, iff at least one subscription was newly added.
    pub fn register(&self, handler: Handler, events: Vec<String>) {
        let added = {
            let mut inner = self.inner.lock().unwrap();
            if events.is_empty() {
                let already = inner.all_handlers.iter().any(|h| h.id == handler.id);
                if !already {
                    inner.all_handlers.push(handler.clone());
                }
                !already
            } else {
                let mut any_added = false;
                for name in &events {
                    let list = inner.named_handlers.entry(name.clone()).or_default();
                    if !list.iter().any(|h| h.id == handler.id) {
                        list.push(handler.clone());
                        any_added = true;
                    }
                }
                any_added
            }
        };

        if added {
            self.post_lifecycle_event(DispatchEvent::HandlerRegistered, &handler.id, &events);
        }
    }

    /// Symmetric with `register`: removes `handler` from each of `events`
    /// (or the all-events list), posting `handler_unregistered` iff
    /// something was actually removed. Removing an unknown pair is a no-op.
    pub fn unregister(&self, handler_id: &HandlerId, events: Vec<String>) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            if events.is_empty() {
                let before = inner.all_handlers.len();
                inner.all_handlers.retain(|h| &h.id != handler_id);
                before != inner.all_handlers.len()
            } else {
                let mut any_removed = false;
                for name in &events {
                    if let Some(list) = inner.named_handlers.get_mut(name) {
                        let before = list.len();
                        list.retain(|h| &h.id != handler_id);
                        if list.len() != before {
                            any_removed = true;
                        }
                        if list.is_empty() {
                            inner.named_handlers.remove(name);
                        }
                    }
                }
                any_removed
            }
        };

        if removed {
            self.post_lifecycle_event(DispatchEvent::HandlerUnregistered, handler_id, &events);
        }
    }

    fn post_lifecycle_event(&self, kind: DispatchEvent, handler_id: &HandlerId, events: &[String]) {
        let mut payload = JsonMap::new();
        payload.insert("events".to_string(), json!(events));
        payload.insert("handler".to_string(), json!(handler_id.0));
        self.post_event(&kind.namespaced_value(), payload, None);
    }

    /// Construct a fresh `Event` and deliver it synchronously to every
    /// matching handler (named handlers, then all-events handlers, in
    /// registration order), skipping `skip`. Then runs the event-mapping
    /// engine and recursively dispatches any mapping that just completed.
    pub fn post_event(&self, name: &str, payload: JsonMap<String, Value>, skip: Option<&HandlerId>) -> Event {
        let event = Event::new(name, payload);
        self.dispatch(&event, skip);
        event
    }

    fn dispatch(&self, event: &Event, skip: Option<&HandlerId>) {
        let (named, all, completed) = {
            let mut inner = self.inner.lock().unwrap();
            if self.logging_enabled.load(Ordering::Relaxed) {
                inner.log.push(event.clone());
            }

            let named = inner
                .named_handlers
                .get(&event.name)
                .cloned()
                .unwrap_or_default();
            let all = inner.all_handlers.clone();

            let completed_keys: Vec<String> = inner
                .maps
                .iter_mut()
                .filter_map(|(key, map)| map.observe(event).then(|| key.clone()))
                .collect();

            let mut completed = Vec::new();
            for key in completed_keys {
                if let Some(map) = inner.maps.remove(&key) {
                    completed.push(map.event_to_post);
                }
            }

            (named, all, completed)
        };

        for handler in named.iter().chain(all.iter()) {
            if Some(&handler.id) == skip {
                continue;
            }
            handler.invoke(event);
        }

        for mapped in completed {
            debug!(channel = %self.channel, event = %mapped.name, "event mapping complete, dispatching synthesized event");
            self.post_event(&mapped.name, mapped.payload, skip);
        }
    }

    /// Install an event mapping, delegating to the configured
    /// `MapManager` override if one is set (used by the client router so
    /// mappings live on the broker).
    pub fn map_events(
        &self,
        events_to_map: Vec<EventMatcher>,
        event_to_post: Event,
        ignore_if_exists: bool,
    ) -> Result<String, EventMapError> {
        if let Some(manager) = self.map_manager.read().unwrap().clone() {
            return manager.map_events(events_to_map, event_to_post, ignore_if_exists);
        }

        validate_events_to_map(&events_to_map)?;
        let key = derive_key(&events_to_map, &event_to_post.name);

        let mut inner = self.inner.lock().unwrap();
        if inner.maps.contains_key(&key) {
            if !ignore_if_exists {
                return Err(EventMapError::DuplicateMapping(key));
            }
            return Ok(key);
        }

        inner
            .maps
            .insert(key.clone(), EventMap::new(key.clone(), events_to_map, event_to_post));
        Ok(key)
    }

    pub fn event_map_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().maps.keys().cloned().collect()
    }
}

impl MapManager for EventDispatch {
    fn map_events(
        &self,
        events_to_map: Vec<EventMatcher>,
        event_to_post: Event,
        ignore_if_exists: bool,
    ) -> Result<String, EventMapError> {
        EventDispatch::map_events(self, events_to_map, event_to_post, ignore_if_exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(id: &str, counter: Arc<AtomicUsize>) -> Handler {
        Handler::new(HandlerId(id.to_string()), move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn register_is_idempotent_for_duplicate_pairs() {
        let dispatch = EventDispatch::new("");
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler("h1", counter.clone());

        dispatch.register(handler.clone(), vec!["greet".to_string()]);
        dispatch.register(handler, vec!["greet".to_string()]);

        dispatch.post_event("greet", JsonMap::new(), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_events_handler_receives_every_post() {
        let dispatch = EventDispatch::new("");
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler("all", counter.clone());
        dispatch.register(handler, vec![]);

        dispatch.post_event("a", JsonMap::new(), None);
        dispatch.post_event("b", JsonMap::new(), None);

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn skip_handler_is_not_invoked() {
        let dispatch = EventDispatch::new("");
        let counter = Arc::new(AtomicUsize::new(0));
        let id = HandlerId("skip-me".to_string());
        let handler = Handler::new(id.clone(), {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        dispatch.register(handler, vec!["x".to_string()]);

        dispatch.post_event("x", JsonMap::new(), Some(&id));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_unknown_pair_is_noop() {
        let dispatch = EventDispatch::new("");
        dispatch.unregister(&HandlerId("nobody".to_string()), vec!["x".to_string()]);
        // No panic, no handler_registered/unregistered observable side effect to assert beyond this.
    }

    #[test]
    fn register_posts_handler_registered_with_full_event_list() {
        let dispatch = EventDispatch::new("");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let observer = Handler::new(HandlerId("observer".to_string()), move |event| {
            if event.name == DispatchEvent::HandlerRegistered.namespaced_value() {
                seen_clone.lock().unwrap().push(event.clone());
            }
        });
        dispatch.register(observer, vec![]);

        let handler = counting_handler("subject", Arc::new(AtomicUsize::new(0)));
        dispatch.register(handler, vec!["a".to_string(), "b".to_string()]);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload.get("events").unwrap(),
            &json!(["a", "b"])
        );
        assert_eq!(events[0].payload.get("handler").unwrap(), &json!("subject"));
    }

    #[test]
    fn map_events_fires_aggregate_and_removes_map() {
        let dispatch = EventDispatch::new("");
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler("done-listener", counter.clone());
        dispatch.register(handler, vec!["done".to_string()]);

        let key = dispatch
            .map_events(
                vec![EventMatcher::new("a", JsonMap::new()), EventMatcher::new("b", JsonMap::new())],
                Event::new("done", JsonMap::new()),
                false,
            )
            .unwrap();
        assert!(dispatch.event_map_keys().contains(&key));

        dispatch.post_event("a", JsonMap::new(), None);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        dispatch.post_event("b", JsonMap::new(), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(dispatch.event_map_keys().is_empty());

        // Re-posting a constituent event does not refire.
        dispatch.post_event("b", JsonMap::new(), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_events_duplicate_key_rejected_unless_ignored() {
        let dispatch = EventDispatch::new("");
        let events = || vec![EventMatcher::new("a", JsonMap::new()), EventMatcher::new("b", JsonMap::new())];

        dispatch
            .map_events(events(), Event::new("done", JsonMap::new()), false)
            .unwrap();

        let err = dispatch
            .map_events(events(), Event::new("done", JsonMap::new()), false)
            .unwrap_err();
        assert!(matches!(err, EventMapError::DuplicateMapping(_)));

        assert!(dispatch
            .map_events(events(), Event::new("done", JsonMap::new()), true)
            .is_ok());
    }

    #[test]
    fn handler_panic_does_not_stop_fanout_to_other_handlers() {
        let dispatch = EventDispatch::new("");
        let panicking = Handler::new(HandlerId("boom".to_string()), |_event| {
            panic!("handler bug");
        });
        dispatch.register(panicking, vec!["x".to_string()]);

        let counter = Arc::new(AtomicUsize::new(0));
        let survivor = counting_handler("survivor", counter.clone());
        dispatch.register(survivor, vec!["x".to_string()]);

        dispatch.post_event("x", JsonMap::new(), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
