//! EventRegistrationManager: aggregate state over all registrants, JSON
//! snapshot persistence, and reaction to callback-failure events.
//!
//! Grounded on `original_source/eventcenter/server/event_center.py`'s
//! `EventRegistrationManager` for exact load/persist/reprocess semantics
//! and on the workspace's `persistence.rs` for the Rust persistence-layer
//! shape (config-bearing struct, tracing spans), adapted from a
//! Postgres-backed store to a single JSON snapshot file (durability
//! beyond that is explicitly out of scope here).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Handler, HandlerId, MapManager};
use crate::dispatch_manager::EventDispatchManager;
use crate::event::{Event, NamespacedEvent, RegistrationEvent};
use crate::event_map::{EventMapError, EventMatcher};
use crate::http_client::CallbackClient;
use crate::registration::{Registrant, ALL_EVENTS_KEY};
use crate::wire::{EventMappingData, RegistrationData, RemoteEventData};

const REGISTRANTS_KEY: &str = "registrants";

pub struct EventRegistrationManager {
    registrants: Mutex<HashMap<String, Registrant>>,
    file_path: PathBuf,
    dispatch_manager: Arc<EventDispatchManager>,
    http_client: Arc<CallbackClient>,
    timeout: Duration,
}

impl EventRegistrationManager {
    /// Load `file_path` (tolerating missing/empty/malformed content by
    /// starting clean) and subscribe to `registration.callback_failed` on
    /// the default dispatch.
    pub fn new(
        file_path: PathBuf,
        dispatch_manager: Arc<EventDispatchManager>,
        timeout: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            registrants: Mutex::new(HashMap::new()),
            file_path,
            dispatch_manager,
            http_client: Arc::new(CallbackClient::new()),
            timeout,
        });

        manager.load_registrants();

        let weak: Weak<Self> = Arc::downgrade(&manager);
        let handler = Handler::new(
            HandlerId("registration_manager::on_event".to_string()),
            move |event| {
                if let Some(strong) = weak.upgrade() {
                    strong.on_event(event);
                }
            },
        );
        manager
            .dispatch_manager
            .default_dispatch()
            .register(handler, vec![RegistrationEvent::CallbackFailed.namespaced_value()]);

        manager
    }

    pub fn register(&self, data: RegistrationData) {
        let mut registrants = self.registrants.lock().unwrap();
        let registrant = registrants
            .entry(data.callback_url.clone())
            .or_insert_with(|| Registrant::new(data.callback_url.clone()));

        let mut changed = false;
        if data.events.is_empty() {
            changed |= registrant.register(None, &data.channel, &self.dispatch_manager, &self.http_client, self.timeout);
        } else {
            for event in &data.events {
                changed |= registrant.register(
                    Some(event),
                    &data.channel,
                    &self.dispatch_manager,
                    &self.http_client,
                    self.timeout,
                );
            }
        }

        if changed {
            self.persist_locked(&registrants);
        }
    }

    pub fn unregister(&self, data: RegistrationData) {
        let mut registrants = self.registrants.lock().unwrap();
        let Some(registrant) = registrants.get_mut(&data.callback_url) else {
            return;
        };

        let mut changed = false;
        if data.events.is_empty() {
            changed |= registrant.unregister(None, &data.channel);
        } else {
            for event in &data.events {
                changed |= registrant.unregister(Some(event), &data.channel);
            }
        }

        if registrant.is_empty() {
            registrants.remove(&data.callback_url);
        }

        if changed {
            self.persist_locked(&registrants);
        }
    }

    pub fn unregister_all(&self, callback_url: &str) {
        let mut registrants = self.registrants.lock().unwrap();
        let Some(mut registrant) = registrants.remove(callback_url) else {
            return;
        };

        let changed = registrant.unregister_all();
        if changed {
            self.persist_locked(&registrants);
        }
    }

    /// Intentionally does not hold `self.registrants`: a slow/unreachable
    /// callback reached during this fanout can trigger
    /// `registration.callback_failed`, which calls back into
    /// `unregister_all` above. Holding the registrants lock across the
    /// dispatch call here would deadlock that reentry.
    pub fn post(&self, remote_event: RemoteEventData) {
        let dispatch = self.dispatch_manager.get_or_create(&remote_event.channel);
        dispatch.post_event(&remote_event.event.name, remote_event.event.payload, None);
    }

    pub fn map_events(&self, mapping: EventMappingData) -> Result<String, EventMapError> {
        let dispatch = self.dispatch_manager.get_or_create(&mapping.channel);
        let matchers: Vec<EventMatcher> = mapping.events_to_map.into_iter().map(EventMatcher::from).collect();
        dispatch.map_events(matchers, mapping.event_to_post, mapping.ignore_if_exists)
    }

    fn on_event(&self, event: &Event) {
        if event.name == RegistrationEvent::CallbackFailed.namespaced_value() {
            if let Some(callback_url) = event.payload.get("callback_url").and_then(Value::as_str) {
                self.unregister_all(callback_url);
            }
        }
    }

    pub fn dispatch_manager(&self) -> Arc<EventDispatchManager> {
        self.dispatch_manager.clone()
    }

    /// Unwrapped `{url: {channel: [event_name, ...]}}`, the shape the
    /// `/registrants` HTTP surface returns.
    pub fn registrants_snapshot(&self) -> Value {
        let registrants = self.registrants.lock().unwrap();
        Value::Object(self.pack(&registrants))
    }

    fn pack(&self, registrants: &HashMap<String, Registrant>) -> Map<String, Value> {
        let mut packed = Map::new();
        for (url, registrant) in registrants {
            let mut channels = Map::new();
            for (channel, events) in registrant.channels_snapshot() {
                channels.insert(channel, json!(events));
            }
            packed.insert(url.clone(), Value::Object(channels));
        }
        packed
    }

    fn persist_locked(&self, registrants: &HashMap<String, Registrant>) {
        let payload = json!({ REGISTRANTS_KEY: self.pack(registrants) });
        if let Err(err) = write_atomically(&self.file_path, &payload) {
            error!(path = %self.file_path.display(), error = %err, "failed to persist registrants snapshot, in-memory state remains authoritative");
        } else {
            debug!(path = %self.file_path.display(), "persisted registrants snapshot");
        }
    }

    fn load_registrants(&self) {
        match read_snapshot(&self.file_path) {
            Ok(Some(data)) => self.reprocess(data),
            Ok(None) => {
                info!(path = %self.file_path.display(), "no registrants snapshot found, starting clean");
                self.write_empty_snapshot();
            }
            Err(err) => {
                warn!(path = %self.file_path.display(), error = %err, "registrants snapshot unreadable, starting clean");
                self.write_empty_snapshot();
            }
        }
    }

    fn write_empty_snapshot(&self) {
        let registrants = self.registrants.lock().unwrap();
        self.persist_locked(&registrants);
    }

    fn reprocess(&self, data: Value) {
        let Some(registrants_obj) = data.get(REGISTRANTS_KEY).and_then(Value::as_object) else {
            warn!("registrants snapshot missing top-level 'registrants' key, starting clean");
            self.write_empty_snapshot();
            return;
        };

        let mut registrants = self.registrants.lock().unwrap();
        for (url, channels) in registrants_obj {
            let Some(channels) = channels.as_object() else { continue };
            for (channel, events) in channels {
                let Some(events) = events.as_array() else { continue };
                let registrant = registrants
                    .entry(url.clone())
                    .or_insert_with(|| Registrant::new(url.clone()));

                for event in events {
                    let Some(name) = event.as_str() else { continue };
                    let event_name = if name == ALL_EVENTS_KEY { None } else { Some(name) };
                    registrant.register(
                        event_name,
                        channel,
                        &self.dispatch_manager,
                        &self.http_client,
                        self.timeout,
                    );
                }
            }
        }
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Value>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&contents).map(Some).map_err(|e| e.to_string())
}

fn write_atomically(path: &Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serde_json::to_vec(value)?)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager_at(path: PathBuf) -> Arc<EventRegistrationManager> {
        EventRegistrationManager::new(path, Arc::new(EventDispatchManager::new()), Duration::from_secs(1))
    }

    #[test]
    fn missing_file_initializes_empty_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrants.json");

        let _manager = manager_at(path.clone());
        let contents = fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value, json!({ "registrants": {} }));
    }

    #[test]
    fn malformed_file_recovers_to_empty_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrants.json");
        fs::write(&path, "not json").unwrap();

        let _manager = manager_at(path.clone());
        let contents = fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value, json!({ "registrants": {} }));
    }

    #[test]
    fn register_persists_and_reload_reconstructs_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrants.json");

        {
            let manager = manager_at(path.clone());
            manager.register(RegistrationData {
                callback_url: "http://a/on_event".to_string(),
                events: vec!["x".to_string(), "y".to_string()],
                channel: "".to_string(),
            });
        }

        let manager = manager_at(path.clone());
        let snapshot = manager.registrants_snapshot();
        assert_eq!(snapshot["http://a/on_event"][""], json!(["x", "y"]));
    }

    #[test]
    fn register_then_unregister_removes_registrant_from_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrants.json");
        let manager = manager_at(path);

        let data = RegistrationData {
            callback_url: "http://a/on_event".to_string(),
            events: vec!["x".to_string()],
            channel: "".to_string(),
        };
        manager.register(data.clone());
        manager.unregister(data);

        let snapshot = manager.registrants_snapshot();
        assert_eq!(snapshot, json!({}));
    }

    #[test]
    fn callback_failed_event_unregisters_affected_registrant() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrants.json");
        let manager = manager_at(path);

        manager.register(RegistrationData {
            callback_url: "http://127.0.0.1:1/on_event".to_string(),
            events: vec!["e".to_string()],
            channel: "".to_string(),
        });

        let dispatch = manager.dispatch_manager.default_dispatch();
        let mut payload = Map::new();
        payload.insert("callback_url".to_string(), json!("http://127.0.0.1:1/on_event"));
        payload.insert("event".to_string(), json!("e"));
        payload.insert("channel".to_string(), json!(""));
        dispatch.post_event(&RegistrationEvent::CallbackFailed.namespaced_value(), payload, None);

        let snapshot = manager.registrants_snapshot();
        assert_eq!(snapshot, json!({}));
    }
}
