//! EventDispatchManager: process-wide registry of channel -> EventDispatch.
//!
//! Grounded on `actors::manager::SessionManagerActor`'s map-of-handles
//! shape, using `dashmap` instead of a `Mutex<HashMap>` so lazy
//! per-channel creation never blocks concurrent lookups on other
//! channels.

use std::sync::Arc;

use dashmap::DashMap;

use crate::dispatch::EventDispatch;

pub const DEFAULT_CHANNEL: &str = "";

pub struct EventDispatchManager {
    dispatchers: DashMap<String, Arc<EventDispatch>>,
}

impl EventDispatchManager {
    pub fn new() -> Self {
        let manager = Self {
            dispatchers: DashMap::new(),
        };
        manager.add_event_dispatch(DEFAULT_CHANNEL);
        manager
    }

    pub fn default_dispatch(&self) -> Arc<EventDispatch> {
        self.add_event_dispatch(DEFAULT_CHANNEL)
    }

    /// Create the dispatch for `channel` if it doesn't exist yet and
    /// return it either way. Never destroyed once created.
    pub fn add_event_dispatch(&self, channel: &str) -> Arc<EventDispatch> {
        self.dispatchers
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(EventDispatch::new(channel)))
            .clone()
    }

    pub fn remove_event_dispatch(&self, channel: &str) {
        self.dispatchers.remove(channel);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<EventDispatch>> {
        self.dispatchers.get(channel).map(|entry| entry.clone())
    }

    /// Look up the dispatch for `channel`, lazily creating it (this is the
    /// entry point used by registrations and the registration manager,
    /// which must never fail to find a channel dispatch).
    pub fn get_or_create(&self, channel: &str) -> Arc<EventDispatch> {
        self.add_event_dispatch(channel)
    }

    pub fn event_dispatchers(&self) -> Vec<(String, Arc<EventDispatch>)> {
        self.dispatchers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for EventDispatchManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dispatch_is_lazily_created_once() {
        let manager = EventDispatchManager::new();
        let a = manager.default_dispatch();
        let b = manager.default_dispatch();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn add_event_dispatch_creates_distinct_channel_instances() {
        let manager = EventDispatchManager::new();
        let red = manager.add_event_dispatch("red");
        let blue = manager.add_event_dispatch("blue");
        assert!(!Arc::ptr_eq(&red, &blue));
        assert_eq!(manager.event_dispatchers().len(), 3); // "", red, blue
    }

    #[test]
    fn get_returns_none_for_unknown_channel() {
        let manager = EventDispatchManager::new();
        assert!(manager.get("unknown").is_none());
    }
}
