//! Configuration and explicit context.
//!
//! Replaces the source's process-global `Properties`/singleton dispatch
//! manager with an explicit `Context` struct constructed at startup and
//! threaded into every component. `Config::from_env` follows the
//! workspace's `main.rs` idiom of reading `env::var(...).unwrap_or_else(...)`
//! rather than pulling in a config-file crate, since the configuration
//! surface here is a flat set of env vars.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch_manager::EventDispatchManager;

#[derive(Debug, Clone)]
pub struct Config {
    pub event_center_url: String,
    pub event_center_port: u16,
    pub event_center_callback_host: String,
    pub event_center_callback_port: u16,
    pub registrants_file_path: PathBuf,
    pub client_callback_timeout: Duration,
    pub router_name: String,
    pub router_channel: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            event_center_url: env::var("EVENT_CENTER_URL")
                .unwrap_or_else(|_| "http://localhost:6000".to_string()),
            event_center_port: env::var("EVENT_CENTER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6000),
            event_center_callback_host: env::var("EVENT_CENTER_CALLBACK_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            event_center_callback_port: env::var("EVENT_CENTER_CALLBACK_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6001),
            registrants_file_path: env::var("REGISTRANTS_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("server/registrants.json")),
            client_callback_timeout: Duration::from_secs(
                env::var("CLIENT_CALLBACK_TIMEOUT_SEC")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            router_name: env::var("ROUTER_NAME").unwrap_or_default(),
            router_channel: env::var("ROUTER_CHANNEL").unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Bundles configuration with the process-wide dispatch manager. One
/// `Context::default()` convenience constructor is provided, but nothing
/// requires it — every component here takes a `Context` (or its pieces)
/// explicitly.
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub dispatch_manager: Arc<EventDispatchManager>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dispatch_manager: Arc::new(EventDispatchManager::new()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
