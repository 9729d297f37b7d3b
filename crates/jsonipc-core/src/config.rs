//! Centralized configuration for the Jsonipc bridge.
//!
//! Constants for the engine endpoint and wire protocol, plus the
//! [`ClientConfig`] a [`Session`](crate::Session) is built from.

use crate::{JsonipcError, Result};
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Engine endpoint defaults.
pub struct EndpointConfig;

impl EndpointConfig {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 27239;
    pub const DEFAULT_PATH: &'static str = "/";
    pub const DEFAULT_CREDENTIAL: &'static str = "auth123";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Wire protocol constants fixed by the engine contract.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Zero-argument method returning the root object id.
    pub const BOOTSTRAP_METHOD: &'static str = "init_jsonipc";
    /// Correlation ids start at `ID_SEED_MULTIPLIER * n` for a random `n`.
    pub const ID_SEED_MULTIPLIER: u64 = 10_000;
    pub const ID_SEED_RANGE: Range<u64> = 10..99;
    /// Capacity of the transport event channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// A fixed `ws://host:port/path` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Build the WebSocket URL for this endpoint.
    pub fn url(&self) -> Result<Url> {
        if self.host.trim().is_empty() {
            return Err(JsonipcError::Validation {
                field: "endpoint".to_string(),
                message: "host must not be empty".to_string(),
            });
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        Ok(Url::parse(&format!("ws://{}:{}{}", self.host, self.port, path))?)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(
            EndpointConfig::DEFAULT_HOST,
            EndpointConfig::DEFAULT_PORT,
            EndpointConfig::DEFAULT_PATH,
        )
    }
}

impl FromStr for Endpoint {
    type Err = JsonipcError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s)?;
        if url.scheme() != "ws" {
            return Err(JsonipcError::Validation {
                field: "endpoint".to_string(),
                message: format!("unsupported scheme: {}", url.scheme()),
            });
        }
        let host = url.host_str().ok_or_else(|| JsonipcError::Validation {
            field: "endpoint".to_string(),
            message: "missing host".to_string(),
        })?;
        Ok(Self::new(
            host,
            url.port_or_known_default().unwrap_or(EndpointConfig::DEFAULT_PORT),
            url.path(),
        ))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Everything needed to open a session against an engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Opaque token presented as the WebSocket subprotocol.
    pub credential: String,
    pub bootstrap_method: String,
    pub connect_timeout: Duration,
    /// Reject outstanding calls when the channel fails instead of leaving
    /// them pending forever.
    pub reject_pending_on_failure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            credential: EndpointConfig::DEFAULT_CREDENTIAL.to_string(),
            bootstrap_method: ProtocolConfig::BOOTSTRAP_METHOD.to_string(),
            connect_timeout: EndpointConfig::CONNECT_TIMEOUT,
            reject_pending_on_failure: true,
        }
    }
}

impl ClientConfig {
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_bootstrap_method(mut self, method: impl Into<String>) -> Self {
        self.bootstrap_method = method.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reject_pending_on_failure(mut self, reject: bool) -> Self {
        self.reject_pending_on_failure = reject;
        self
    }

    /// Check the fields a connection cannot be attempted without.
    pub fn validate(&self) -> Result<()> {
        self.endpoint.url()?;
        if self.credential.is_empty() {
            return Err(JsonipcError::Validation {
                field: "credential".to_string(),
                message: "credential must not be empty".to_string(),
            });
        }
        if self.bootstrap_method.is_empty() {
            return Err(JsonipcError::Validation {
                field: "bootstrap_method".to_string(),
                message: "bootstrap method must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
