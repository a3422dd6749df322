//! HTTP client wrappers: POST JSON with a timeout, surfacing a
//! distinguishable connection error.
//!
//! Grounded on `integrations::cross_system::CrossSystemError` /
//! `reqwest::Client` in the parent workspace. Two clients are provided:
//! `CallbackClient` (blocking) is used inside `Registration`, which runs
//! synchronously as part of `EventDispatch`'s delivery loop; `BrokerClient`
//! (async) is used by the client-side adapter, whose calls are not
//! nested inside a dispatch fanout and can simply be awaited.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("connection error calling {url}")]
    Connection { url: String, #[source] source: reqwest::Error },

    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl CallbackError {
    /// True for the failures treated as "unreachable" (connection
    /// refused/timeout/invalid schema), distinct from a protocol-level
    /// non-2xx response.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, CallbackError::Connection { .. })
    }
}

/// Blocking JSON POST client used by `Registration::on_event`.
pub struct CallbackClient {
    client: reqwest::blocking::Client,
}

impl CallbackClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn post_json(&self, url: &str, body: &impl Serialize, timeout: Duration) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .map_err(|source| CallbackError::Connection {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CallbackError::InvalidResponse {
                url: url.to_string(),
                message: response.status().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CallbackClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Async JSON POST client used by `EventCenterAdapter` to talk to the
/// broker's REST API.
pub struct BrokerClient {
    client: reqwest::Client,
}

impl BrokerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn post_json<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<serde_json::Value, CallbackError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|source| CallbackError::Connection {
                url: url.to_string(),
                source,
            })?;

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|source| CallbackError::Connection {
                url: url.to_string(),
                source,
            })
    }

    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, CallbackError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| CallbackError::Connection {
                url: url.to_string(),
                source,
            })?;

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|source| CallbackError::Connection {
                url: url.to_string(),
                source,
            })
    }
}

impl Default for BrokerClient {
    fn default() -> Self {
        Self::new()
    }
}
