//! # birdnet-mqtt-client: resilient broker session for detection publishing
//!
//! An async MQTT client library built on `rumqttc` that keeps one broker
//! session alive for a long-running detector and publishes events to it:
//!
//! - **Connection manager** with manual-connect cooldown and automatic
//!   reconnection using exponential backoff
//! - **Pre-flight checks**: certificate files and broker DNS are validated
//!   before any session is attempted
//! - **Diagnostics**: a staged DNS/TCP/MQTT/publish test streamed as results
//! - **Home Assistant discovery** for every audio source plus a bridge device
//! - **TLS** via rustls, with optional mutual authentication
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use birdnet_mqtt_client::{ClientConfig, ConnectionManager, RumqttTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig {
//!     broker: "tcp://localhost:1883".into(),
//!     topic: "birdnet".into(),
//!     ..Default::default()
//! };
//! let transport = Arc::new(RumqttTransport::from_config(&config)?);
//! let manager = ConnectionManager::new(config, transport)?;
//!
//! let cancel = CancellationToken::new();
//! manager.connect(&cancel).await?;
//! manager.publish(&cancel, "birdnet", event.to_json()?).await?;
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected
//!                              │
//!                       (network error)
//!                              ▼
//!                        Disconnected
//!                              │
//!                        (apply backoff)
//!                              ▼
//!                       Reconnecting(secs) ──(delay elapsed)──> Connecting
//! ```
//!
//! Manual `connect` calls are rate limited by the cooldown; attempts made by
//! the reconnect loop are not. `disconnect` stops the loop.
//!
//! # Error Handling
//!
//! Everything returns [`Result`], an alias over [`ClientError`]. Use
//! [`ClientError::category`] to decide how to react; configuration errors
//! are fatal and never retried automatically.

pub mod availability;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod event;
pub mod metrics;
pub mod precheck;
pub mod state;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use availability::Availability;
pub use config::{ClientConfig, LastWillConfig, TlsConfig};
pub use connection::{ConnectionManager, ConnectionManagerBuilder};
pub use diagnostics::{DiagnosticRunner, Stage, TestResult, TestState};
pub use discovery::{
    AudioSource, DiscoveryConfig, DiscoveryPublisher, DiscoverySettings, RetainedPublisher,
};
pub use error::{ClientError, ErrorCategory};
pub use event::{BirdImage, EventDto};
pub use metrics::{MetricsSink, NoopMetrics};
pub use precheck::BrokerUrl;
pub use state::{ConnectionState, ConnectionStatus};
pub use transport::{RumqttTransport, Transport};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, ClientError>;
