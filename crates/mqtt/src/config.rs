//! Client configuration.
//!
//! `ClientConfig` is supplied once by the settings provider and is immutable
//! after the connection manager is built. It deserializes from the `[mqtt]`
//! table of the application config; every field has a default so a minimal
//! file only needs `broker`.
//!
//! ```toml
//! [mqtt]
//! broker = "mqtts://broker.example.com"
//! username = "birdnet"
//! password = "secret"
//! topic = "birdnet"
//! reconnect_cooldown = 5
//!
//! [mqtt.tls]
//! ca_cert = "/etc/birdnet-mqtt/ca.pem"
//!
//! [mqtt.last_will]
//! topic = "birdnet/status"
//! payload = "offline"
//! ```
//!
//! Durations are whole seconds except `disconnect_timeout_ms`, which is
//! milliseconds and additionally capped by [`MAX_DISCONNECT_TIMEOUT`].
//!
//! Certificate files are deliberately *not* checked here: the connection
//! manager checks them on every `connect`, in a fixed order, so a file that
//! appears after startup is picked up.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::precheck::BrokerUrl;

/// Upper bound for the graceful close performed by `disconnect`.
pub const MAX_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker client configuration.
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URL, e.g. `tcp://localhost:1883` or `mqtts://broker:8883`.
    #[validate(custom(function = "validate_broker_url"))]
    pub broker: String,

    /// Client identifier. Empty means a random UUID is generated per client.
    #[validate(length(max = 64, message = "Client ID must not exceed 64 characters"))]
    pub client_id: String,

    pub username: String,

    pub password: String,

    /// Default topic for event publishes.
    #[validate(length(max = 255, message = "Topic must not exceed 255 characters"))]
    pub topic: String,

    /// Retain flag applied by `publish`.
    pub retain: bool,

    /// Minimum interval between manual connect attempts (seconds).
    pub reconnect_cooldown: u64,

    /// First delay of the reconnect loop (seconds).
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Cap of the reconnect delay (seconds).
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Max reconnect delay must be between 1 and 86400 seconds"
    ))]
    pub max_reconnect_delay: u64,

    /// Handshake timeout (seconds).
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connect timeout must be between 1 and 300 seconds"
    ))]
    pub connect_timeout: u64,

    /// Publish timeout (seconds).
    #[validate(range(
        min = 1,
        max = 300,
        message = "Publish timeout must be between 1 and 300 seconds"
    ))]
    pub publish_timeout: u64,

    /// Graceful close budget (milliseconds), capped at one second.
    pub disconnect_timeout_ms: u64,

    /// MQTT keep-alive (seconds).
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Capacity of the request channel between client and event loop.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Request channel capacity must be between 1 and 1000"
    ))]
    pub request_channel_capacity: usize,

    #[validate(nested)]
    pub tls: TlsConfig,

    #[validate(nested)]
    pub last_will: Option<LastWillConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            broker: "tcp://localhost:1883".to_string(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            topic: "birdnet".to_string(),
            retain: false,
            reconnect_cooldown: 5,
            reconnect_delay: 1,
            max_reconnect_delay: 60,
            connect_timeout: 30,
            publish_timeout: 10,
            disconnect_timeout_ms: 250,
            keep_alive: 30,
            request_channel_capacity: 10,
            tls: TlsConfig::default(),
            last_will: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "<redacted>" },
            )
            .field("topic", &self.topic)
            .field("retain", &self.retain)
            .field("reconnect_cooldown", &self.reconnect_cooldown)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("disconnect_timeout_ms", &self.disconnect_timeout_ms)
            .field("keep_alive", &self.keep_alive)
            .field("request_channel_capacity", &self.request_channel_capacity)
            .field("tls", &self.tls)
            .field("last_will", &self.last_will)
            .finish()
    }
}

impl ClientConfig {
    pub fn broker_url(&self) -> crate::Result<BrokerUrl> {
        BrokerUrl::parse(&self.broker)
    }

    /// TLS is on when enabled explicitly or implied by the URL scheme.
    pub fn tls_enabled(&self) -> bool {
        self.tls.enabled
            || self
                .broker_url()
                .map(|url| url.requires_tls())
                .unwrap_or(false)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout)
    }

    /// Effective disconnect budget, never above [`MAX_DISCONNECT_TIMEOUT`].
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms).min(MAX_DISCONNECT_TIMEOUT)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Returns the configured id trimmed, or a fresh UUID when blank.
    pub fn effective_client_id(&self) -> String {
        match self.client_id.trim() {
            "" => uuid::Uuid::new_v4().to_string(),
            id => id.to_string(),
        }
    }
}

/// Transport security settings.
///
/// Paths are optional individually: a CA alone verifies the broker, adding
/// a client certificate and key enables mutual TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_client_auth_pair"))]
pub struct TlsConfig {
    /// Forces TLS on even for a `tcp://` URL.
    pub enabled: bool,

    /// Accept any server certificate. For self-signed test brokers only.
    pub insecure_skip_verify: bool,

    pub ca_cert: Option<String>,

    pub client_cert: Option<String>,

    pub client_key: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert: impl Into<String>) -> Self {
        TlsConfig {
            enabled: true,
            ca_cert: Some(ca_cert.into()),
            ..Default::default()
        }
    }

    pub fn with_client_auth(
        ca_cert: impl Into<String>,
        client_cert: impl Into<String>,
        client_key: impl Into<String>,
    ) -> Self {
        TlsConfig {
            enabled: true,
            insecure_skip_verify: false,
            ca_cert: Some(ca_cert.into()),
            client_cert: Some(client_cert.into()),
            client_key: Some(client_key.into()),
        }
    }

    pub fn ca_cert_path(&self) -> Option<&str> {
        non_empty(&self.ca_cert)
    }

    pub fn client_cert_path(&self) -> Option<&str> {
        non_empty(&self.client_cert)
    }

    pub fn client_key_path(&self) -> Option<&str> {
        non_empty(&self.client_key)
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path().is_some() && self.client_key_path().is_some()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Last Will and Testament published by the broker on unclean disconnect.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LastWillConfig {
    #[validate(length(min = 1, max = 255, message = "Last will topic must not be empty"))]
    pub topic: String,

    pub payload: String,

    /// 0 or 1; exactly-once delivery is not supported.
    #[validate(range(max = 1, message = "Last will QoS must be 0 or 1"))]
    pub qos: u8,

    pub retain: bool,
}

impl Default for LastWillConfig {
    fn default() -> Self {
        LastWillConfig {
            topic: "birdnet/status".to_string(),
            payload: "offline".to_string(),
            qos: 1,
            retain: true,
        }
    }
}

fn validate_broker_url(broker: &str) -> Result<(), ValidationError> {
    BrokerUrl::parse(broker).map(|_| ()).map_err(|e| {
        let mut err = ValidationError::new("invalid_broker_url");
        err.message = Some(e.to_string().into());
        err
    })
}

fn validate_client_auth_pair(tls: &TlsConfig) -> Result<(), ValidationError> {
    match (tls.client_cert_path(), tls.client_key_path()) {
        (Some(_), None) | (None, Some(_)) => {
            let mut err = ValidationError::new("incomplete_client_auth");
            err.message =
                Some("client_cert and client_key must be configured together".into());
            Err(err)
        }
        _ => Ok(()),
    }
}
