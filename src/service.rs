//! EventCenterService: the broker's HTTP surface in front of
//! `EventRegistrationManager`.
//!
//! Handler shapes (parse JSON into a `Data` object, delegate, return
//! `{success, ...}` or `{success:"false", error}`) are grounded on
//! `original_source/eventcenter/server/service.py`; the `actix-web`
//! request/response plumbing (`web::Data`, `web::Json`,
//! `HttpResponse::Ok().json(...)`) follows the workspace's existing API
//! module conventions.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use tracing::info;

use crate::event::{EventCenterEvent, NamespacedEvent};
use crate::registration_manager::EventRegistrationManager;
use crate::server::{spawn_http_server, RunningServer};
use crate::wire::{ApiResponse, EventMappingData, RegistrationData, RemoteEventData, UnregisterAllData};

pub struct EventCenterServiceState {
    pub registration_manager: Arc<EventRegistrationManager>,
}

pub fn configure(cfg: &mut web::ServiceConfig, state: web::Data<EventCenterServiceState>) {
    cfg.app_data(state)
        .route("/ping", web::get().to(ping))
        .route("/register", web::post().to(register))
        .route("/unregister", web::post().to(unregister))
        .route("/unregister_all", web::post().to(unregister_all))
        .route("/post_event", web::post().to(post_event))
        .route("/map_events", web::post().to(map_events))
        .route("/registrants", web::get().to(registrants))
        .route("/shutdown", web::get().to(shutdown));
}

async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok())
}

async fn register(state: web::Data<EventCenterServiceState>, data: web::Json<RegistrationData>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let _ = web::block(move || manager.register(data.into_inner())).await;
    HttpResponse::Ok().json(ApiResponse::ok())
}

async fn unregister(state: web::Data<EventCenterServiceState>, data: web::Json<RegistrationData>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let _ = web::block(move || manager.unregister(data.into_inner())).await;
    HttpResponse::Ok().json(ApiResponse::ok())
}

async fn unregister_all(state: web::Data<EventCenterServiceState>, data: web::Json<UnregisterAllData>) -> HttpResponse {
    if data.callback_url.is_empty() {
        return HttpResponse::Ok().json(ApiResponse::error("Missing callback url"));
    }

    let manager = state.registration_manager.clone();
    let url = data.callback_url.clone();
    let _ = web::block(move || manager.unregister_all(&url)).await;
    HttpResponse::Ok().json(ApiResponse::ok())
}

async fn post_event(state: web::Data<EventCenterServiceState>, data: web::Json<RemoteEventData>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let _ = web::block(move || manager.post(data.into_inner())).await;
    HttpResponse::Ok().json(ApiResponse::ok())
}

async fn map_events(state: web::Data<EventCenterServiceState>, data: web::Json<EventMappingData>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let result = web::block(move || manager.map_events(data.into_inner())).await;

    match result {
        Ok(Ok(key)) => HttpResponse::Ok().json(ApiResponse::ok_with_key(key)),
        Ok(Err(err)) => HttpResponse::Ok().json(ApiResponse::error(err.to_string())),
        Err(err) => HttpResponse::Ok().json(ApiResponse::error(err.to_string())),
    }
}

async fn registrants(state: web::Data<EventCenterServiceState>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let snapshot = web::block(move || manager.registrants_snapshot())
        .await
        .unwrap_or_else(|_| serde_json::json!({}));
    HttpResponse::Ok().json(ApiResponse::ok_with_registrants(snapshot))
}

/// Spawns a detached worker that stops the HTTP server and posts
/// `event_center.stopped`, returning immediately.
async fn shutdown(state: web::Data<EventCenterServiceState>, server: web::Data<ServerHandleHolder>) -> HttpResponse {
    let manager = state.registration_manager.clone();
    let holder = server.get_ref().clone();
    tokio::spawn(async move {
        if let Some(running) = holder.take() {
            running.shutdown(true).await;
        }
        manager
            .dispatch_manager()
            .default_dispatch()
            .post_event(&EventCenterEvent::Stopped.namespaced_value(), serde_json::Map::new(), None);
    });

    HttpResponse::Ok().json(ApiResponse::ok())
}

/// Holds the running server so `/shutdown` can stop it from a detached
/// task without the handler itself blocking on its own shutdown.
#[derive(Clone)]
pub struct ServerHandleHolder(Arc<std::sync::Mutex<Option<RunningServer>>>);

impl ServerHandleHolder {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new(None)))
    }

    pub fn install(&self, server: RunningServer) {
        *self.0.lock().unwrap() = Some(server);
    }

    fn take(&self) -> Option<RunningServer> {
        self.0.lock().unwrap().take()
    }
}

impl Default for ServerHandleHolder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_event_center(
    host: &str,
    port: u16,
    registration_manager: Arc<EventRegistrationManager>,
) -> std::io::Result<()> {
    let state = web::Data::new(EventCenterServiceState {
        registration_manager: registration_manager.clone(),
    });
    let holder = web::Data::new(ServerHandleHolder::new());
    let holder_for_install = holder.clone();

    let running = spawn_http_server(host, port, move |cfg| {
        configure(cfg, state.clone());
        cfg.app_data(holder.clone());
    })?;

    info!(host, port, "event center listening");
    registration_manager
        .dispatch_manager()
        .default_dispatch()
        .post_event(&EventCenterEvent::Started.namespaced_value(), serde_json::Map::new(), None);

    holder_for_install.install(running);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch_manager::EventDispatchManager;
    use actix_web::{test, App};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_state() -> web::Data<EventCenterServiceState> {
        let dir = tempdir().unwrap();
        let manager = EventRegistrationManager::new(
            dir.path().join("registrants.json"),
            Arc::new(EventDispatchManager::new()),
            Duration::from_secs(1),
        );
        std::mem::forget(dir); // keep tempdir alive for the duration of the test
        web::Data::new(EventCenterServiceState {
            registration_manager: manager,
        })
    }

    #[actix_web::test]
    async fn ping_returns_success() {
        let app = test::init_service(App::new().route("/ping", web::get().to(ping))).await;
        let req = test::TestRequest::get().uri("/ping").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn register_then_registrants_reflects_subscription() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/register", web::post().to(register))
                .route("/registrants", web::get().to(registrants)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/register")
            .set_json(RegistrationData {
                callback_url: "http://a/on_event".to_string(),
                events: vec!["greet".to_string()],
                channel: "".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/registrants").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            body["registrants"]["http://a/on_event"][""],
            serde_json::json!(["greet"])
        );
    }

    #[actix_web::test]
    async fn unregister_all_without_callback_url_errors() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/unregister_all", web::post().to(unregister_all)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/unregister_all")
            .set_json(UnregisterAllData {
                callback_url: "".to_string(),
            })
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], "false");
        assert_eq!(body["error"], "Missing callback url");
    }
}
