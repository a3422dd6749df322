//! Event Center broker
//!
//! Entry point for the broker process: loads configuration, restores
//! the registrants snapshot, and serves the HTTP API until it receives
//! `GET /shutdown` or SIGINT.

use std::env;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_center::config::Config;
use event_center::registration_manager::EventRegistrationManager;
use event_center::service;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting event center broker");

    let config = Config::from_env();
    let dispatch_manager = Arc::new(event_center::dispatch_manager::EventDispatchManager::new());
    let registration_manager = EventRegistrationManager::new(
        config.registrants_file_path.clone(),
        dispatch_manager,
        config.client_callback_timeout,
    );

    service::run_event_center("0.0.0.0", config.event_center_port, registration_manager).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");
    Ok(())
}
