//! Event Center
//!
//! A distributed publish/subscribe broker that connects independent
//! client processes ("Event Routers") through HTTP callbacks: clients
//! register interest in named events, optionally scoped to a channel,
//! and the broker fans out published events to every registered
//! callback URL. Event mappings synthesize an aggregate event once a
//! set of constituent events has all been observed.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod dispatch_manager;
pub mod event;
pub mod event_map;
pub mod http_client;
pub mod registration;
pub mod registration_manager;
pub mod server;
pub mod service;
pub mod wire;

pub use config::{Config, Context};
pub use event::Event;
pub use registration_manager::EventRegistrationManager;
