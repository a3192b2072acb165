//! Error taxonomy for the broker client.
//!
//! `ClientError` is the single error type returned by the connection manager,
//! the validators, the diagnostic runner and the discovery publisher. Every
//! variant maps to an [`ErrorCategory`], which is what metrics are labelled
//! with and what the diagnostic runner reports to operators.
//!
//! # Categories
//!
//! **Configuration** (fatal, never retried automatically):
//! - `InvalidBrokerUrl`, `ConfigValidation`
//! - `CaCertMissing`, `ClientCertMissing`, `ClientKeyMissing`, `TlsMaterial`
//!
//! **DNS** (network triage, surfaced separately from handshake failures):
//! - `Dns`
//!
//! **Cooldown** (expected, retry after `remaining`):
//! - `Cooldown`
//!
//! **Timeout vs cancellation** (never conflated):
//! - `ConnectTimeout`, `PublishTimeout`, `DnsTimeout`
//! - `Cancelled`
//!
//! **Connection / publish** (runtime):
//! - `Handshake`, `Connection`, `Io`
//! - `NotConnected`, `Publish`, `Client`
//!
//! Error text is safe to log verbatim: credentials never appear in it.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::backoff::BackoffError;

/// Unified error type for broker operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker URL could not be parsed or uses an unsupported scheme.
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    /// Field-level validation of the client configuration failed.
    #[error("invalid client configuration: {0}")]
    ConfigValidation(#[from] validator::ValidationErrors),

    /// TLS is enabled and the configured CA certificate is missing.
    #[error("CA certificate file does not exist: {0}")]
    CaCertMissing(String),

    /// TLS is enabled and the configured client certificate is missing.
    #[error("client certificate file does not exist: {0}")]
    ClientCertMissing(String),

    /// TLS is enabled and the configured client key is missing.
    #[error("client key file does not exist: {0}")]
    ClientKeyMissing(String),

    /// Certificate material exists but cannot be read or used.
    #[error("TLS configuration error: {0}")]
    TlsMaterial(String),

    /// Hostname resolution failed before any session was attempted.
    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    /// The resolver did not answer within the lookup budget.
    #[error("DNS lookup for {host} timed out after {timeout:?}")]
    DnsTimeout { host: String, timeout: Duration },

    /// A manual connect was attempted inside the cooldown window.
    ///
    /// `remaining` is how long the caller has to wait before trying again.
    #[error("connection attempt rejected: cooldown active, retry in {remaining:?}")]
    Cooldown { remaining: Duration },

    /// The handshake did not complete within the connect timeout.
    #[error("connection timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker did not accept the publish within the publish timeout.
    #[error("publish timeout after {0:?}")]
    PublishTimeout(Duration),

    /// The caller cancelled the operation.
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// The broker refused or aborted the session handshake.
    #[error("broker handshake failed: {0}")]
    Handshake(String),

    /// Network-level failure reported by the MQTT event loop.
    #[error("connection error: {0}")]
    Connection(#[from] Box<rumqttc::ConnectionError>),

    /// A publish was attempted without an established session.
    #[error("not connected to MQTT broker")]
    NotConnected,

    /// The publish was rejected by the client or broker.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The request channel towards the event loop is closed.
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// A payload could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bounded retries ran out.
    #[error("retries exhausted: {0}")]
    RetriesExhausted(#[from] BackoffError),

    /// Discovery publishing failed for at least one entity.
    ///
    /// Carries the first error encountered; the remaining entities were still
    /// attempted.
    #[error("failed to publish discovery for one or more sources: {0}")]
    Discovery(#[source] Box<ClientError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for ClientError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        ClientError::Connection(Box::new(err))
    }
}

/// Coarse classification used for metric labels and diagnostic messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Dns,
    Cooldown,
    Timeout,
    Cancelled,
    Connection,
    Publish,
    Serialization,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "config",
            ErrorCategory::Dns => "dns",
            ErrorCategory::Cooldown => "cooldown",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Publish => "publish",
            ErrorCategory::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientError {
    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::InvalidBrokerUrl(_)
            | ClientError::ConfigValidation(_)
            | ClientError::CaCertMissing(_)
            | ClientError::ClientCertMissing(_)
            | ClientError::ClientKeyMissing(_)
            | ClientError::TlsMaterial(_) => ErrorCategory::Configuration,
            ClientError::Dns { .. } => ErrorCategory::Dns,
            ClientError::Cooldown { .. } => ErrorCategory::Cooldown,
            ClientError::ConnectTimeout(_)
            | ClientError::PublishTimeout(_)
            | ClientError::DnsTimeout { .. } => ErrorCategory::Timeout,
            ClientError::Cancelled(_) => ErrorCategory::Cancelled,
            ClientError::Handshake(_)
            | ClientError::Connection(_)
            | ClientError::RetriesExhausted(_)
            | ClientError::Io(_) => ErrorCategory::Connection,
            ClientError::NotConnected | ClientError::Publish(_) | ClientError::Client(_) => {
                ErrorCategory::Publish
            }
            ClientError::Serialization(_) => ErrorCategory::Serialization,
            ClientError::Discovery(inner) => inner.category(),
        }
    }

    /// Configuration errors are never retried by the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }
}
