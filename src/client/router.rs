//! EventRouter: the client-side bridge between the local EventDispatch
//! and the remote broker.
//!
//! The source serializes `on_internal_event` behind a mutex; since the
//! dispatch's handler closures must stay synchronous (`Fn(&Event)`) while
//! the adapter calls are async, this is modeled instead as a single
//! background task draining an mpsc channel — one consumer, so internal
//! and external events are still processed one at a time in arrival
//! order, without blocking the dispatch's own mutex while awaiting HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::adapter::{EventCenterAdapter, RemoteEventHandler};
use crate::dispatch::{Handler, HandlerId, MapManager};
use crate::dispatch_manager::EventDispatchManager;
use crate::event::{DispatchEvent, Event, NamespacedEvent, RouterEvent};
use crate::event_map::{EventMapError, EventMatcher};
use crate::wire::{EventMappingData, RemoteEventData};

enum RouterMessage {
    Internal(Event),
    External(RemoteEventData),
}

struct AdapterBridge(mpsc::UnboundedSender<RouterMessage>);

#[async_trait]
impl RemoteEventHandler for AdapterBridge {
    async fn handle(&self, remote_event: RemoteEventData) {
        let _ = self.0.send(RouterMessage::External(remote_event));
    }
}

/// Installed as the default dispatch's `event_map_manager` so local
/// `map_events` calls create the mapping on the broker instead. Kept
/// synchronous with its own blocking client, matching
/// `EventDispatch::map_events`'s synchronous signature.
struct RouterMapManager {
    broker_url: String,
    channel: String,
    client: reqwest::blocking::Client,
}

impl MapManager for RouterMapManager {
    fn map_events(
        &self,
        events_to_map: Vec<EventMatcher>,
        event_to_post: Event,
        ignore_if_exists: bool,
    ) -> Result<String, EventMapError> {
        let events_to_map = events_to_map
            .into_iter()
            .map(|matcher| Event::new(matcher.name, matcher.payload_subset))
            .collect();

        let data = EventMappingData {
            channel: self.channel.clone(),
            events_to_map,
            event_to_post,
            ignore_if_exists,
        };

        let url = format!("{}/map_events", self.broker_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&data)
            .send()
            .map_err(|err| EventMapError::Rpc(err.to_string()))?;

        let body: Value = response.json().map_err(|err| EventMapError::Rpc(err.to_string()))?;
        if body.get("success").and_then(Value::as_str) == Some("true") {
            body.get("event_map_key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| EventMapError::Rpc("broker omitted event_map_key".to_string()))
        } else {
            let message = body.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            Err(EventMapError::Remote(message.to_string()))
        }
    }
}

struct RouterWorker {
    adapter: Arc<EventCenterAdapter>,
    dispatch: Arc<crate::dispatch::EventDispatch>,
    handler_id: HandlerId,
    channel: String,
    callback_url: String,
    router_name: String,
}

impl RouterWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<RouterMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                RouterMessage::Internal(event) => self.on_internal_event(event).await,
                RouterMessage::External(remote_event) => self.on_external_event(remote_event).await,
            }
        }
    }

    fn emit_diagnostic(&self, kind: RouterEvent, event_name: &str) {
        let mut payload = JsonMap::new();
        payload.insert("event".to_string(), json!(event_name));
        self.dispatch
            .post_event(&kind.namespaced_value(), payload, Some(&self.handler_id));
    }

    /// Drops re-entrant events arriving back from the broker, mirrors
    /// subscription changes, and otherwise stamps and forwards a local
    /// publication to the broker.
    async fn on_internal_event(&self, mut event: Event) {
        self.emit_diagnostic(RouterEvent::GotInternalEvent, &event.name);

        if event.metadata().external_event_id().is_some() && event.metadata().external_event_time().is_some() {
            debug!(event = %event.name, "dropping internal event, already arrived from the broker");
            return;
        }

        if event.name == DispatchEvent::HandlerRegistered.namespaced_value()
            || event.name == DispatchEvent::HandlerUnregistered.namespaced_value()
        {
            self.on_subscription_change(&event).await;
            return;
        }

        self.emit_diagnostic(RouterEvent::PropagatingInternalEvent, &event.name);

        let original_id = event.id.clone();
        let original_time = event.time.to_rfc3339();
        event
            .metadata_mut()
            .set_sender_url(self.callback_url.clone())
            .set_original(original_id, original_time, self.router_name.clone());

        self.adapter.post_event(event, &self.channel).await;
    }

    /// Mirrors a local subscription change to the broker, unless it is the
    /// router's own all-events subscription (which would otherwise make
    /// the router subscribe to its own diagnostic plumbing remotely).
    async fn on_subscription_change(&self, event: &Event) {
        let Some(handler) = event.payload.get("handler").and_then(Value::as_str) else {
            return;
        };
        if handler == self.handler_id.0 {
            return;
        }

        let events = event
            .payload
            .get("events")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
            .unwrap_or_default();

        if event.name == DispatchEvent::HandlerRegistered.namespaced_value() {
            self.adapter.register(events, &self.channel, &self.callback_url).await;
        } else {
            self.adapter.unregister(events, &self.channel, &self.callback_url).await;
        }
    }

    /// Stamps an arriving remote event with ingress metadata and
    /// re-posts it locally, skipping the router's own handler so it
    /// cannot bounce back out to the broker.
    async fn on_external_event(&self, remote_event: RemoteEventData) {
        self.emit_diagnostic(RouterEvent::GotExternalEvent, &remote_event.event.name);

        let mut event = remote_event.event;
        let original_id = event.id.clone();
        let original_time = event.time.to_rfc3339();
        event.metadata_mut().set_external(original_id, original_time, remote_event.channel);

        self.dispatch.post_event(&event.name, event.payload, Some(&self.handler_id));
    }
}

/// Client-side bridge: mirrors local subscriptions to the broker, posts
/// local publications remotely, and re-injects arriving remote events
/// locally while preventing echo loops.
pub struct EventRouter {
    handler_id: HandlerId,
    adapter: Arc<EventCenterAdapter>,
}

impl EventRouter {
    pub async fn start(
        dispatch_manager: Arc<EventDispatchManager>,
        broker_url: impl Into<String>,
        callback_host: &str,
        callback_port: u16,
        channel: impl Into<String>,
        router_name: impl Into<String>,
    ) -> std::io::Result<Arc<Self>> {
        let broker_url = broker_url.into();
        let channel = channel.into();
        let router_name = router_name.into();
        let callback_url = format!("http://{callback_host}:{callback_port}/on_event");

        let (tx, rx) = mpsc::unbounded_channel::<RouterMessage>();

        let adapter = EventCenterAdapter::start(
            broker_url.clone(),
            callback_host,
            callback_port,
            Arc::new(AdapterBridge(tx.clone())),
        )?;

        adapter.unregister_all(&callback_url).await;

        let dispatch = dispatch_manager.default_dispatch();
        let handler_id = HandlerId::generated("router");

        let worker = RouterWorker {
            adapter: adapter.clone(),
            dispatch: dispatch.clone(),
            handler_id: handler_id.clone(),
            channel: channel.clone(),
            callback_url,
            router_name,
        };
        tokio::spawn(worker.run(rx));

        let forward_id = handler_id.clone();
        let handler = Handler::new(forward_id, move |event: &Event| {
            let _ = tx.send(RouterMessage::Internal(event.clone()));
        });
        dispatch.register(handler, vec![]);

        dispatch.set_map_manager(Some(Arc::new(RouterMapManager {
            broker_url,
            channel,
            client: reqwest::blocking::Client::new(),
        })));

        Ok(Arc::new(Self { handler_id, adapter }))
    }

    pub fn handler_id(&self) -> &HandlerId {
        &self.handler_id
    }

    pub fn adapter(&self) -> &Arc<EventCenterAdapter> {
        &self.adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::net::TcpListener;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn starting_router_unregisters_stale_state_for_its_own_callback_url() {
        let broker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/unregister_all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success":"true"})))
            .expect(1)
            .mount(&broker)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success":"true"})))
            .mount(&broker)
            .await;

        let dispatch_manager = Arc::new(EventDispatchManager::new());
        let port = free_port();
        let _router = EventRouter::start(dispatch_manager, broker.uri(), "127.0.0.1", port, "", "test-router")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn local_publish_is_mirrored_to_broker_post_event() {
        let broker = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success":"true"})))
            .mount(&broker)
            .await;

        let dispatch_manager = Arc::new(EventDispatchManager::new());
        let port = free_port();
        let router = EventRouter::start(
            dispatch_manager.clone(),
            broker.uri(),
            "127.0.0.1",
            port,
            "",
            "test-router",
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let dispatch = dispatch_manager.default_dispatch();
        dispatch.post_event("greet", Map::new(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = router.handler_id();
    }
}
