//! Connection state types.
//!
//! Two views of the same session live here:
//!
//! - [`ConnectionStatus`] is the observable status broadcast over a
//!   `tokio::sync::watch` channel. Transports publish it, the connection
//!   manager watches it for unexpected loss, and the application maps it
//!   to readiness.
//! - [`ConnectionState`] is the manager's private bookkeeping (connected flag,
//!   last manual attempt, current reconnect delay). It only changes under the
//!   manager's lock.
//!
//! # Examples
//!
//! ```ignore
//! use birdnet_mqtt_client::ConnectionStatus;
//!
//! let status = ConnectionStatus::Reconnecting(4.0);
//! println!("Status: {}", status);  // "Reconnecting (in 4 seconds)"
//! println!("Type: {}", status.as_str());  // "Reconnecting"
//! ```

use std::{fmt, time::Duration};

use tokio::time::Instant;

/// Observable status of the broker session.
///
/// ```text
/// Connecting -> Connected -> Disconnected(reason) -> Reconnecting(delay) -> Connecting -> ...
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    /// Handshake in progress (CONNECT sent, waiting for CONNACK).
    Connecting,

    /// Session established; publishes will be accepted.
    Connected,

    /// Session lost or closed. The string carries the reason.
    Disconnected(String),

    /// Waiting `f64` seconds before the next automatic attempt.
    Reconnecting(f64),
}

impl ConnectionStatus {
    /// Returns a short static identifier for the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected(_) => "Disconnected",
            ConnectionStatus::Reconnecting(_) => "Reconnecting",
        }
    }

    /// Returns contextual details: the loss reason or the pending delay.
    pub fn details(&self) -> String {
        match self {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => String::new(),
            ConnectionStatus::Disconnected(reason) => reason.clone(),
            ConnectionStatus::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting(_)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Mutable session bookkeeping owned by the connection manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    /// True between a successful handshake and the next loss or disconnect.
    pub connected: bool,

    /// When the last manual connect was admitted. `None` until the first one.
    pub last_connection_attempt: Option<Instant>,

    /// Delay the reconnect loop is currently waiting, zero when idle.
    pub reconnect_backoff: Duration,
}

impl ConnectionState {
    /// Checks the cooldown gate for a manual attempt at `now`.
    ///
    /// Returns the remaining wait when the attempt falls inside the window.
    /// An attempt exactly `cooldown` after the previous one is admitted.
    pub fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Option<Duration> {
        let last = self.last_connection_attempt?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.reconnect_backoff = Duration::ZERO;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }
}
