//! Registration: per-(callback_url, channel, event) subscription state.
//!
//! Grounded on `original_source/eventcenter/server/event_center.py`'s
//! `Registration` class for exact semantics (echo prevention, idempotent
//! cancel, callback-failure handling) and on `actors::session::SessionActor`
//! for the Rust-side lifecycle-object idiom: an owned handle that
//! registers itself with a dispatcher on construction and unregisters on
//! cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::dispatch::{Handler, HandlerId};
use crate::dispatch_manager::EventDispatchManager;
use crate::event::{Event, NamespacedEvent, RegistrationEvent};
use crate::http_client::CallbackClient;
use crate::wire::RemoteEventData;

/// One subscription: `callback_url` wants events named `event_name` (or
/// every event, when `None`) on `channel` delivered by HTTP POST.
pub struct Registration {
    callback_url: String,
    event_name: Option<String>,
    channel: String,
    cancelled: AtomicBool,
    dispatch: Arc<crate::dispatch::EventDispatch>,
    http_client: Arc<CallbackClient>,
    handler_id: HandlerId,
    timeout: Duration,
}

impl Registration {
    /// Construct and immediately register with the channel's dispatch
    /// (creating it if this is the first registration for the channel).
    pub fn new(
        callback_url: impl Into<String>,
        event_name: Option<String>,
        channel: impl Into<String>,
        dispatch_manager: &EventDispatchManager,
        http_client: Arc<CallbackClient>,
        timeout: Duration,
    ) -> Arc<Self> {
        let callback_url = callback_url.into();
        let channel = channel.into();
        let dispatch = dispatch_manager.get_or_create(&channel);
        let handler_id = HandlerId::generated(&format!("registration:{callback_url}"));

        let registration = Arc::new(Self {
            callback_url,
            event_name,
            channel,
            cancelled: AtomicBool::new(false),
            dispatch,
            http_client,
            handler_id,
            timeout,
        });

        let events = registration.event_list();
        let for_handler = registration.clone();
        let handler = Handler::new(registration.handler_id.clone(), move |event| {
            for_handler.on_event(event)
        });
        registration.dispatch.register(handler, events);

        registration
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn event_list(&self) -> Vec<String> {
        match &self.event_name {
            Some(name) => vec![name.clone()],
            None => vec![],
        }
    }

    /// Idempotent: unregisters from the dispatch exactly once.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatch.unregister(&self.handler_id, self.event_list());
    }

    fn on_event(&self, event: &Event) {
        if self.is_cancelled() {
            debug!(url = %self.callback_url, event = %event.name, "skipping post, registration cancelled");
            return;
        }

        if let Some(sender_url) = event.metadata().sender_url() {
            if !sender_url.is_empty() && self.callback_url.starts_with(sender_url) {
                debug!(url = %self.callback_url, event = %event.name, "skipping post, destination is originator");
                return;
            }
        }

        let remote = RemoteEventData {
            channel: self.channel.clone(),
            event: event.clone(),
        };

        match self.http_client.post_json(&self.callback_url, &remote, self.timeout) {
            Ok(()) => debug!(url = %self.callback_url, event = %event.name, "posted event to callback"),
            Err(err) => {
                debug!(url = %self.callback_url, error = %err, "callback unreachable, cancelling registration");
                self.handle_unreachable_client();
            }
        }
    }

    fn handle_unreachable_client(&self) {
        self.cancel();

        let mut payload = serde_json::Map::new();
        payload.insert("channel".to_string(), serde_json::json!(self.channel));
        payload.insert("callback_url".to_string(), serde_json::json!(self.callback_url));
        payload.insert(
            "event".to_string(),
            serde_json::json!(self.event_name.clone().unwrap_or_default()),
        );

        self.dispatch
            .post_event(&RegistrationEvent::CallbackFailed.namespaced_value(), payload, None);
    }
}

/// Key used for the "all events" registration inside a channel's map,
/// matching the chosen list-form persisted representation (`[""]`).
pub const ALL_EVENTS_KEY: &str = "";

/// All of one callback URL's registrations, grouped by
/// `channel -> event_name -> Registration` (explicit nesting, rather
/// than a combined `"channel:event"` string key).
pub struct Registrant {
    callback_url: String,
    registrations: std::collections::HashMap<String, std::collections::HashMap<String, Arc<Registration>>>,
}

impl Registrant {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            registrations: std::collections::HashMap::new(),
        }
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Returns true iff a new `Registration` was created (false when the
    /// `(channel, event_name)` key already existed).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        event_name: Option<&str>,
        channel: &str,
        dispatch_manager: &EventDispatchManager,
        http_client: &Arc<CallbackClient>,
        timeout: Duration,
    ) -> bool {
        let key = event_name.unwrap_or(ALL_EVENTS_KEY).to_string();
        let channel_map = self.registrations.entry(channel.to_string()).or_default();

        if channel_map.contains_key(&key) {
            return false;
        }

        let registration = Registration::new(
            self.callback_url.clone(),
            event_name.map(str::to_string),
            channel.to_string(),
            dispatch_manager,
            http_client.clone(),
            timeout,
        );
        channel_map.insert(key, registration);
        true
    }

    /// Returns true iff a `Registration` was found and removed.
    pub fn unregister(&mut self, event_name: Option<&str>, channel: &str) -> bool {
        let key = event_name.unwrap_or(ALL_EVENTS_KEY);

        let Some(channel_map) = self.registrations.get_mut(channel) else {
            return false;
        };

        let Some(registration) = channel_map.remove(key) else {
            return false;
        };
        registration.cancel();

        if channel_map.is_empty() {
            self.registrations.remove(channel);
        }

        true
    }

    /// Cancels every contained registration and clears the map. Returns
    /// true iff there was anything to unregister.
    pub fn unregister_all(&mut self) -> bool {
        let had_any = !self.registrations.is_empty();
        for channel_map in self.registrations.values() {
            for registration in channel_map.values() {
                registration.cancel();
            }
        }
        self.registrations.clear();
        had_any
    }

    /// Snapshot as `channel -> [event_names]`, using `""` to denote the
    /// all-events subscription. Event names are sorted so the same steady
    /// state always serializes to the same bytes, regardless of the
    /// underlying map's iteration order.
    pub fn channels_snapshot(&self) -> std::collections::HashMap<String, Vec<String>> {
        self.registrations
            .iter()
            .map(|(channel, events)| {
                let mut names: Vec<String> = events.keys().cloned().collect();
                names.sort_unstable();
                (channel.clone(), names)
            })
            .collect()
    }
}
