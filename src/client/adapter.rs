//! EventCenterAdapter: the client-side REST bridge to the broker.
//!
//! Owns the callback-ingress HTTP server (`GET /ping`, `POST /on_event`)
//! the same way `EventCenterService` owns the broker's surface, built on
//! the same `server::spawn_http_server` helper, and exposes
//! broker-facing calls (`register`/`unregister`/`post_event`/
//! `map_events`) over `http_client::BrokerClient`.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use async_trait::async_trait;
use tracing::warn;

use crate::event::Event;
use crate::event_map::EventMapError;
use crate::http_client::BrokerClient;
use crate::server::{spawn_http_server, RunningServer};
use crate::wire::{EventMappingData, RegistrationData, RemoteEventData, UnregisterAllData};

/// Receives events the broker has forwarded to this client's `/on_event`.
/// Implemented by `EventRouter::on_external_event` in production; a plain
/// closure or mock is enough for tests.
#[async_trait]
pub trait RemoteEventHandler: Send + Sync {
    async fn handle(&self, remote_event: RemoteEventData);
}

struct AdapterState {
    event_handler: Arc<dyn RemoteEventHandler>,
}

async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": "true" }))
}

/// Hands the event to the configured handler on a fresh task so the HTTP
/// response returns immediately, letting the handler itself make outbound
/// calls without risking a deadlock against this request.
async fn on_event(state: web::Data<AdapterState>, data: web::Json<RemoteEventData>) -> HttpResponse {
    let handler = state.event_handler.clone();
    let remote_event = data.into_inner();
    tokio::spawn(async move { handler.handle(remote_event).await });
    HttpResponse::Ok().json(serde_json::json!({}))
}

pub struct EventCenterAdapter {
    broker_url: String,
    broker_client: BrokerClient,
    _server: RunningServer,
}

impl EventCenterAdapter {
    /// Bind `callback_host:callback_port` and serve the callback ingress,
    /// delivering arriving events to `event_handler`.
    pub fn start(
        broker_url: impl Into<String>,
        callback_host: &str,
        callback_port: u16,
        event_handler: Arc<dyn RemoteEventHandler>,
    ) -> std::io::Result<Arc<Self>> {
        let state = web::Data::new(AdapterState { event_handler });

        let server = spawn_http_server(callback_host, callback_port, move |cfg| {
            cfg.app_data(state.clone())
                .route("/ping", web::get().to(ping))
                .route("/on_event", web::post().to(on_event));
        })?;

        Ok(Arc::new(Self {
            broker_url: broker_url.into(),
            broker_client: BrokerClient::new(),
            _server: server,
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.broker_url.trim_end_matches('/'), path)
    }

    /// Connection errors are suppressed (logged only): a failed
    /// `/register` call is treated as transient, with the router free to
    /// retry on its own schedule.
    pub async fn register(&self, events: Vec<String>, channel: &str, callback_url: &str) {
        let data = RegistrationData {
            callback_url: callback_url.to_string(),
            events,
            channel: channel.to_string(),
        };
        if let Err(err) = self.broker_client.post_json(&self.url("/register"), &data).await {
            warn!(error = %err, "failed to register with broker");
        }
    }

    pub async fn unregister(&self, events: Vec<String>, channel: &str, callback_url: &str) {
        let data = RegistrationData {
            callback_url: callback_url.to_string(),
            events,
            channel: channel.to_string(),
        };
        if let Err(err) = self.broker_client.post_json(&self.url("/unregister"), &data).await {
            warn!(error = %err, "failed to unregister with broker");
        }
    }

    pub async fn unregister_all(&self, callback_url: &str) {
        let data = UnregisterAllData {
            callback_url: callback_url.to_string(),
        };
        if let Err(err) = self.broker_client.post_json(&self.url("/unregister_all"), &data).await {
            warn!(error = %err, "failed to unregister_all with broker");
        }
    }

    pub async fn post_event(&self, event: Event, channel: &str) {
        let data = RemoteEventData {
            channel: channel.to_string(),
            event,
        };
        if let Err(err) = self.broker_client.post_json(&self.url("/post_event"), &data).await {
            warn!(error = %err, "failed to post event to broker");
        }
    }

    /// Does not suppress connection errors: the caller needs the returned
    /// `event_map_key`.
    pub async fn map_events(
        &self,
        channel: &str,
        events_to_map: Vec<Event>,
        event_to_post: Event,
        ignore_if_exists: bool,
    ) -> Result<String, EventMapError> {
        let data = EventMappingData {
            channel: channel.to_string(),
            events_to_map,
            event_to_post,
            ignore_if_exists,
        };

        let response = self
            .broker_client
            .post_json(&self.url("/map_events"), &data)
            .await
            .map_err(|err| EventMapError::Rpc(err.to_string()))?;

        if response.get("success").and_then(|v| v.as_str()) == Some("true") {
            response
                .get("event_map_key")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| EventMapError::Rpc("broker omitted event_map_key".to_string()))
        } else {
            let message = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Err(EventMapError::Remote(message))
        }
    }
}
