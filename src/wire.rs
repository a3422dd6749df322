//! Wire-format envelopes exchanged between routers and the broker.
//!
//! These mirror the `Data`-derived request/response bodies of the original
//! `eventcenter` Python package (`RegistrationData`, `RemoteEventData`,
//! `EventMappingData`) one field at a time, so the JSON shapes are
//! byte-compatible with the broker's documented HTTP API.

use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub callback_url: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterAllData {
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEventData {
    #[serde(default)]
    pub channel: String,
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMappingData {
    #[serde(default)]
    pub channel: String,
    pub events_to_map: Vec<Event>,
    pub event_to_post: Event,
    #[serde(default)]
    pub ignore_if_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_map_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrants: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: "true".to_string(),
            error: None,
            event_map_key: None,
            registrants: None,
        }
    }

    pub fn ok_with_key(key: impl Into<String>) -> Self {
        Self {
            success: "true".to_string(),
            error: None,
            event_map_key: Some(key.into()),
            registrants: None,
        }
    }

    pub fn ok_with_registrants(registrants: serde_json::Value) -> Self {
        Self {
            success: "true".to_string(),
            error: None,
            event_map_key: None,
            registrants: Some(registrants),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: "false".to_string(),
            error: Some(message.into()),
            event_map_key: None,
            registrants: None,
        }
    }
}
